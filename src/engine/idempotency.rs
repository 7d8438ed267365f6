use std::future::Future;

use crate::limits::MAX_IDEMPOTENCY_KEY_LEN;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn idempotency_lookup(&self, key: &str, route: &str) -> Option<IdempotencyRecord> {
        self.idempotency
            .get(&(key.to_string(), route.to_string()))
            .map(|r| r.value().clone())
    }

    /// Memoize a keyed mutating call.
    ///
    /// A stored record for (key, route) short-circuits `compute` entirely
    /// and returns the recorded response verbatim. Otherwise `compute` runs
    /// — performing its own durable mutation — and its response is recorded
    /// afterward. A crash between the mutation and the record leaves
    /// at-most-one side effect and an unmemoized retry, so `compute` must
    /// re-derive a truthful result from state (a confirm on an
    /// already-Converted hold reports the conflict, it never re-creates).
    ///
    /// `Err` from `compute` is an internal failure: nothing is recorded and
    /// the caller retries. Expected outcomes (conflict, expired) arrive as
    /// `Ok((response, Outcome::Failed))` and are memoized like successes.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        route: &str,
        compute: F,
    ) -> Result<(String, Outcome), EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Outcome), EngineError>>,
    {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::LimitExceeded("idempotency key length"));
        }
        if let Some(record) = self.idempotency_lookup(key, route) {
            return Ok((record.response, record.outcome));
        }

        let (response, outcome) = compute().await?;

        // A concurrent duplicate may have recorded first; its response is
        // the one every later retry must see.
        if let Some(record) = self.idempotency_lookup(key, route) {
            return Ok((record.response, record.outcome));
        }
        let record = IdempotencyRecord {
            key: key.to_string(),
            route: route.to_string(),
            response: response.clone(),
            outcome,
        };
        self.persist_and_apply(Event::IdempotencyRecorded { record }).await?;
        Ok((response, outcome))
    }
}

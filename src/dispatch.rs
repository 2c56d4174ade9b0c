use crate::accounts::AccountPool;
use crate::normalize::GenerationRequest;
use crate::upstream::{FailureClass, ImageUpstream, UpstreamFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub image: String,
    pub account_used: u32,
    pub attempted: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Every account was tried and every one was rate limited, or the pool was
    /// empty. `last_error` is `None` only for an empty pool.
    Exhausted {
        attempted: Vec<u32>,
        last_error: Option<UpstreamFailure>,
    },
    /// A non-quota failure stopped the loop at `account`.
    Fatal {
        account: u32,
        attempted: Vec<u32>,
        failure: UpstreamFailure,
    },
}

/// Tries each account in pool order, one call at a time. The first success
/// wins; a rate-limited failure moves on to the next account; any other
/// failure aborts immediately.
pub async fn dispatch<U>(
    upstream: &U,
    pool: &AccountPool,
    request: &GenerationRequest,
) -> Result<Dispatched, DispatchError>
where
    U: ImageUpstream + ?Sized,
{
    let mut attempted = Vec::with_capacity(pool.len());
    let mut last_error = None;

    for account in pool {
        attempted.push(account.index);
        match upstream.generate(account, request).await {
            Ok(image) => {
                record_attempt("success");
                tracing::info!(
                    account = account.index,
                    attempts = attempted.len(),
                    "image generated"
                );
                return Ok(Dispatched {
                    image,
                    account_used: account.index,
                    attempted,
                });
            }
            Err(failure) => {
                record_attempt(failure.class.as_str());
                match failure.class {
                    FailureClass::RateLimited => {
                        tracing::warn!(
                            account = account.index,
                            status = ?failure.status,
                            error = %failure.message,
                            "account rate limited, failing over"
                        );
                        last_error = Some(failure);
                    }
                    FailureClass::Fatal => {
                        tracing::error!(
                            account = account.index,
                            status = ?failure.status,
                            error = %failure.message,
                            "upstream failure, not failing over"
                        );
                        return Err(DispatchError::Fatal {
                            account: account.index,
                            attempted,
                            failure,
                        });
                    }
                }
            }
        }
    }

    tracing::error!(attempted = ?attempted, "all accounts exhausted");
    Err(DispatchError::Exhausted {
        attempted,
        last_error,
    })
}

fn record_attempt(outcome: &'static str) {
    metrics::counter!("fluxgate_upstream_attempts_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use crate::config::GenerationDefaults;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    enum Outcome {
        Image(&'static str),
        RateLimited,
        Fatal,
    }

    /// Scripted upstream: each account index maps to a fixed outcome, and every
    /// call is recorded.
    struct ScriptedUpstream {
        outcomes: HashMap<u32, Outcome>,
        calls: Mutex<Vec<u32>>,
    }

    impl ScriptedUpstream {
        fn new(outcomes: Vec<(u32, Outcome)>) -> Self {
            Self {
                outcomes: outcomes.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageUpstream for ScriptedUpstream {
        async fn generate(
            &self,
            account: &Account,
            _request: &GenerationRequest,
        ) -> Result<String, UpstreamFailure> {
            self.calls.lock().unwrap().push(account.index);
            match self.outcomes.get(&account.index) {
                Some(Outcome::Image(image)) => Ok(image.to_string()),
                Some(Outcome::RateLimited) => Err(UpstreamFailure::classified(
                    Some(429),
                    format!("quota exceeded on account {}", account.index),
                )),
                Some(Outcome::Fatal) | None => Err(UpstreamFailure::classified(
                    Some(400),
                    format!("bad request on account {}", account.index),
                )),
            }
        }
    }

    fn pool(n: u32) -> AccountPool {
        AccountPool::from_accounts(
            (1..=n)
                .map(|index| Account {
                    index,
                    token: format!("tok-{index}"),
                    account_id: format!("acc-{index}"),
                })
                .collect(),
        )
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("a red fox", GenerationDefaults::default()).unwrap()
    }

    #[tokio::test]
    async fn first_account_success_stops_loop() {
        let upstream = ScriptedUpstream::new(vec![
            (1, Outcome::Image("ONE")),
            (2, Outcome::Image("TWO")),
        ]);
        let result = dispatch(&upstream, &pool(2), &request()).await.unwrap();
        assert_eq!(result.image, "ONE");
        assert_eq!(result.account_used, 1);
        assert_eq!(upstream.calls(), vec![1]);
    }

    #[tokio::test]
    async fn rate_limited_accounts_fail_over_until_success() {
        let upstream = ScriptedUpstream::new(vec![
            (1, Outcome::RateLimited),
            (2, Outcome::RateLimited),
            (3, Outcome::Image("THREE")),
            (4, Outcome::Image("FOUR")),
        ]);
        let result = dispatch(&upstream, &pool(4), &request()).await.unwrap();
        assert_eq!(result.account_used, 3);
        assert_eq!(result.image, "THREE");
        assert_eq!(result.attempted, vec![1, 2, 3]);
        assert_eq!(upstream.calls(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fatal_failure_aborts_without_trying_next_account() {
        let upstream = ScriptedUpstream::new(vec![
            (1, Outcome::Fatal),
            (2, Outcome::Image("TWO")),
        ]);
        let err = dispatch(&upstream, &pool(2), &request()).await.unwrap_err();
        match err {
            DispatchError::Fatal {
                account,
                attempted,
                failure,
            } => {
                assert_eq!(account, 1);
                assert_eq!(attempted, vec![1]);
                assert_eq!(failure.status, Some(400));
                assert_eq!(failure.message, "bad request on account 1");
            }
            other => panic!("expected fatal, got {other:?}"),
        }
        assert_eq!(upstream.calls(), vec![1]);
    }

    #[tokio::test]
    async fn fatal_after_rate_limit_still_aborts() {
        let upstream = ScriptedUpstream::new(vec![
            (1, Outcome::RateLimited),
            (2, Outcome::Fatal),
            (3, Outcome::Image("THREE")),
        ]);
        let err = dispatch(&upstream, &pool(3), &request()).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Fatal { account: 2, ref attempted, .. } if *attempted == vec![1, 2]
        ));
        assert_eq!(upstream.calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted_without_calls() {
        let upstream = ScriptedUpstream::new(vec![]);
        let err = dispatch(&upstream, &AccountPool::default(), &request())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::Exhausted {
                attempted: vec![],
                last_error: None
            }
        );
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn all_rate_limited_reports_every_attempt_and_last_error() {
        let upstream = ScriptedUpstream::new(
            (1..=5).map(|i| (i, Outcome::RateLimited)).collect(),
        );
        let err = dispatch(&upstream, &pool(5), &request()).await.unwrap_err();
        match err {
            DispatchError::Exhausted {
                attempted,
                last_error,
            } => {
                assert_eq!(attempted, vec![1, 2, 3, 4, 5]);
                let last = last_error.unwrap();
                assert_eq!(last.message, "quota exceeded on account 5");
                assert!(last.is_rate_limited());
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attempts_follow_slot_order_not_insertion_order() {
        let upstream = ScriptedUpstream::new(vec![
            (2, Outcome::RateLimited),
            (5, Outcome::RateLimited),
            (9, Outcome::Image("NINE")),
        ]);
        let accounts = [9, 2, 5]
            .into_iter()
            .map(|index| Account {
                index,
                token: "t".into(),
                account_id: "a".into(),
            })
            .collect();
        let result = dispatch(&upstream, &AccountPool::from_accounts(accounts), &request())
            .await
            .unwrap();
        assert_eq!(result.account_used, 9);
        assert_eq!(upstream.calls(), vec![2, 5, 9]);
    }
}

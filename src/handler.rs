// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Structured Error Routing
//!
//! `execute` runs an async action and routes its outcome through the callbacks
//! of a `Handling` configuration:
//!
//! - exactly one of `on_success`, `on_custom_error` (when its matcher accepts
//!   the error) or `on_error` runs;
//! - `always` runs last, whatever happened, and its own error is returned;
//! - each error route decides with `rethrow` whether the error still
//!   propagates after its callback ran. Errors no route handles propagate.

use std::future::Future;

pub type SuccessCallback<'a, T> = Box<dyn FnOnce(&T) + Send + 'a>;
pub type ErrorCallback<'a, E> = Box<dyn FnOnce(&E) + Send + 'a>;
pub type ErrorMatcher<'a, E> = Box<dyn Fn(&E) -> bool + Send + 'a>;
pub type AlwaysCallback<'a, E> = Box<dyn FnOnce() -> Result<(), E> + Send + 'a>;

/// Callback for a class of errors.
pub struct ErrorRoute<'a, E> {
    callback: ErrorCallback<'a, E>,
    rethrow: bool,
}

/// Callback restricted to the errors `matches` accepts.
pub struct CustomErrorRoute<'a, E> {
    matches: ErrorMatcher<'a, E>,
    route: ErrorRoute<'a, E>,
}

/// Callbacks applied to the outcome of an action.
pub struct Handling<'a, T, E> {
    on_success: Option<SuccessCallback<'a, T>>,
    on_error: Option<ErrorRoute<'a, E>>,
    on_custom_error: Option<CustomErrorRoute<'a, E>>,
    always: Option<AlwaysCallback<'a, E>>,
}

impl<T, E> Default for Handling<'_, T, E> {
    fn default() -> Self {
        Handling {
            on_success: None,
            on_error: None,
            on_custom_error: None,
            always: None,
        }
    }
}

impl<'a, T, E> Handling<'a, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, callback: impl FnOnce(&T) + Send + 'a) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(&E) + Send + 'a, rethrow: bool) -> Self {
        self.on_error = Some(ErrorRoute {
            callback: Box::new(callback),
            rethrow,
        });
        self
    }

    pub fn on_custom_error(
        mut self,
        matches: impl Fn(&E) -> bool + Send + 'a,
        callback: impl FnOnce(&E) + Send + 'a,
        rethrow: bool,
    ) -> Self {
        self.on_custom_error = Some(CustomErrorRoute {
            matches: Box::new(matches),
            route: ErrorRoute {
                callback: Box::new(callback),
                rethrow,
            },
        });
        self
    }

    pub fn always(mut self, callback: impl FnOnce() -> Result<(), E> + Send + 'a) -> Self {
        self.always = Some(Box::new(callback));
        self
    }
}

/// Runs `action` and applies `handling` to its outcome.
///
/// Returns `Ok(Some(value))` on success, `Ok(None)` when an error route
/// handled the error without rethrowing, and `Err` otherwise.
pub async fn execute<'a, T, E, F>(action: F, handling: Handling<'a, T, E>) -> Result<Option<T>, E>
where
    F: Future<Output = Result<T, E>>,
{
    let Handling {
        on_success,
        on_error,
        on_custom_error,
        always,
    } = handling;

    let outcome = match action.await {
        Ok(value) => {
            if let Some(callback) = on_success {
                callback(&value);
            }
            Ok(Some(value))
        }
        Err(err) => {
            let route = match on_custom_error {
                Some(custom) if (custom.matches)(&err) => Some(custom.route),
                _ => on_error,
            };

            match route {
                Some(ErrorRoute { callback, rethrow }) => {
                    callback(&err);
                    if rethrow {
                        Err(err)
                    } else {
                        Ok(None)
                    }
                }
                None => Err(err),
            }
        }
    };

    if let Some(callback) = always {
        callback()?;
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Debug, PartialEq)]
    enum Failure {
        Timeout,
        Invalid,
        Cleanup,
    }

    #[tokio::test]
    async fn success_runs_success_and_always() {
        let calls = Mutex::new(vec![]);

        let result = execute(
            async { Ok::<_, Failure>(7) },
            Handling::<i32, Failure>::new()
                .on_success(|v| calls.lock().unwrap().push(format!("success {v}")))
                .on_error(|_| calls.lock().unwrap().push("error".into()), false)
                .always(|| {
                    calls.lock().unwrap().push("always".into());
                    Ok(())
                }),
        )
        .await;

        assert_eq!(result, Ok(Some(7)));
        assert_eq!(*calls.lock().unwrap(), vec!["success 7", "always"]);
    }

    #[tokio::test]
    async fn custom_route_takes_precedence_over_generic_route() {
        let generic = AtomicUsize::new(0);
        let custom = AtomicUsize::new(0);

        let result = execute(
            async { Err::<(), _>(Failure::Invalid) },
            Handling::<(), Failure>::new()
                .on_error(
                    |_| {
                        generic.fetch_add(1, Ordering::SeqCst);
                    },
                    false,
                )
                .on_custom_error(
                    |e| *e == Failure::Invalid,
                    |_| {
                        custom.fetch_add(1, Ordering::SeqCst);
                    },
                    false,
                ),
        )
        .await;

        assert_eq!(result, Ok(None));
        assert_eq!(generic.load(Ordering::SeqCst), 0);
        assert_eq!(custom.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_custom_route_falls_back_and_rethrows() {
        let generic = AtomicUsize::new(0);

        let result = execute(
            async { Err::<(), _>(Failure::Timeout) },
            Handling::<(), Failure>::new()
                .on_error(
                    |_| {
                        generic.fetch_add(1, Ordering::SeqCst);
                    },
                    true,
                )
                .on_custom_error(|e| *e == Failure::Invalid, |_| {}, false),
        )
        .await;

        assert_eq!(result, Err(Failure::Timeout));
        assert_eq!(generic.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhandled_errors_propagate() {
        let result = execute(
            async { Err::<(), _>(Failure::Timeout) },
            Handling::<(), Failure>::new(),
        )
        .await;

        assert_eq!(result, Err(Failure::Timeout));
    }

    #[tokio::test]
    async fn always_failure_is_not_swallowed() {
        let result = execute(
            async { Ok::<_, Failure>(1) },
            Handling::<i32, Failure>::new().always(|| Err(Failure::Cleanup)),
        )
        .await;

        assert_eq!(result, Err(Failure::Cleanup));
    }
}

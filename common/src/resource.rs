//! Open/close lifecycle shared by stateful components.
//!
//! A [`Resource`] moves through `Idle -> Opening -> Open -> Closing -> Closed`.
//! The open and close hooks are supplied by the owning component at call
//! time, so the resource itself holds no reference back to its owner.
//!
//! - `open` runs its hook at most once. Concurrent and later callers observe
//!   the same outcome, including a failure.
//! - `close` runs its hook at most once, and only if open succeeded. It waits
//!   for an in-flight open to settle first.
//! - Once closing has started, `open` fails with [`ResourceError::Closed`].

use std::future::Future;

use tokio::sync::{OnceCell, watch};

/// Lifecycle state of a [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Error returned by lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// The resource has been closed (or is closing) and cannot be opened.
    Closed,
}

impl std::error::Error for ResourceError {}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceError::Closed => write!(f, "Resource is closed"),
        }
    }
}

/// What a close attempt should do given the state it found.
enum CloseAction {
    RunHook,
    Skip,
    Wait,
}

/// Lifecycle state machine.
///
/// `E` is the error type produced by the open hook. It must be cloneable
/// because the outcome of the single open attempt is handed to every caller.
pub struct Resource<E = ResourceError> {
    state: watch::Sender<ResourceState>,
    opened: OnceCell<Result<(), E>>,
    closed: OnceCell<()>,
}

impl<E> Default for Resource<E>
where
    E: Clone + From<ResourceError>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Resource<E>
where
    E: Clone + From<ResourceError>,
{
    pub fn new() -> Self {
        let (state, _) = watch::channel(ResourceState::Idle);
        Self {
            state,
            opened: OnceCell::new(),
            closed: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ResourceState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ResourceState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ResourceState::Closed
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch(&self) -> watch::Receiver<ResourceState> {
        self.state.subscribe()
    }

    /// Fails with [`ResourceError::Closed`] unless the resource is open.
    pub fn ensure_open(&self) -> Result<(), E> {
        match self.state() {
            ResourceState::Open => Ok(()),
            _ => Err(ResourceError::Closed.into()),
        }
    }

    /// Opens the resource, running `hook` if this is the first attempt.
    pub async fn open<F, Fut>(&self, hook: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if matches!(
            self.state(),
            ResourceState::Closing | ResourceState::Closed
        ) {
            return Err(ResourceError::Closed.into());
        }

        let outcome = self
            .opened
            .get_or_init(|| async {
                // Opening is only seen here if a previous attempt was cancelled
                // mid-hook.
                let started = self.state.send_if_modified(|state| match state {
                    ResourceState::Idle | ResourceState::Opening => {
                        *state = ResourceState::Opening;
                        true
                    }
                    _ => false,
                });
                if !started {
                    return Err(ResourceError::Closed.into());
                }

                let result = hook().await;
                self.state.send_replace(match result {
                    Ok(()) => ResourceState::Open,
                    Err(_) => ResourceState::Idle,
                });
                result
            })
            .await;
        outcome.clone()
    }

    /// Closes the resource. Runs `hook` only if the resource reached `Open`.
    ///
    /// Always leaves the resource `Closed`.
    pub async fn close<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.closed
            .get_or_init(|| async {
                let mut rx = self.state.subscribe();
                let run_hook = loop {
                    let mut action = CloseAction::Wait;
                    self.state.send_if_modified(|state| match state {
                        ResourceState::Idle => {
                            *state = ResourceState::Closed;
                            action = CloseAction::Skip;
                            true
                        }
                        ResourceState::Open => {
                            *state = ResourceState::Closing;
                            action = CloseAction::RunHook;
                            true
                        }
                        ResourceState::Opening => false,
                        ResourceState::Closing | ResourceState::Closed => {
                            action = CloseAction::Skip;
                            false
                        }
                    });
                    match action {
                        CloseAction::RunHook => break true,
                        CloseAction::Skip => break false,
                        CloseAction::Wait => {
                            if rx
                                .wait_for(|state| *state != ResourceState::Opening)
                                .await
                                .is_err()
                            {
                                break false;
                            }
                        }
                    }
                };

                if run_hook {
                    hook().await;
                }
                self.state.send_replace(ResourceState::Closed);
            })
            .await;
    }
}

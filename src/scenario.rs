use std::{fmt, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};

use crate::{error::EngineError, session::Session, step::Step};

/// The work one session performs per iteration.
pub type Action = Arc<dyn Fn(Session) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

/// A named action run by every session of a phase.
///
/// The action receives the session and resolves when the iteration is over. An error
/// fails the phase the session runs for.
///
/// # Example
/// ```rust
/// use volley::Scenario;
///
/// let scenario = Scenario::new("hello", |session| async move {
///     session.set_var("greeting", "hello");
///     Ok(())
/// });
/// assert_eq!(scenario.name, "hello");
/// ```
#[derive(Clone)]
pub struct Scenario {
    pub name: String,
    pub action: Action,
}

impl Scenario {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(move |session| action(session).boxed()),
        }
    }

    /// Scenario running `steps` in order, stopping at the first failing one.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let steps: Arc<[Step]> = steps.into();
        Self::new(name, move |session| {
            let steps = steps.clone();
            async move {
                for step in steps.iter() {
                    step.run(&session).await?;
                }
                Ok(())
            }
        })
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish()
    }
}

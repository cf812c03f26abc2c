//! Error values that cross the reconciler boundary.
//!
//! Render- and commit-phase failures are carried as opaque [`CapturedValue`]s
//! so the component layer can attach whatever payload it likes (a panic
//! message, an error struct, a rejected wakeable's reason). Only the two
//! conditions the reconciler cannot recover from surface as [`ReconcileError`].

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::fiber::FiberId;

/// An opaque value captured from a failing render or commit sub-step.
///
/// The reconciler never inspects `value`; it only routes it to the nearest
/// boundary that can capture it. `description` exists so logs and fatal
/// errors stay readable without downcasting.
#[derive(Clone)]
pub struct CapturedValue {
    pub value: Rc<dyn Any>,
    pub source: Option<FiberId>,
    pub description: Option<String>,
}

impl CapturedValue {
    pub fn new(value: Rc<dyn Any>) -> Self {
        Self {
            value,
            source: None,
            description: None,
        }
    }

    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            value: Rc::new(msg.clone()),
            source: None,
            description: Some(msg),
        }
    }

    pub fn with_source(mut self, source: FiberId) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Debug for CapturedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedValue")
            .field("source", &self.source)
            .field(
                "description",
                &self.description.as_deref().unwrap_or("<opaque>"),
            )
            .finish()
    }
}

/// A failure the reconciler cannot route to a boundary.
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    /// A layout effect (or lifecycle) kept scheduling sync updates; after
    /// [`crate::NESTED_UPDATE_LIMIT`] cascading commits on the same root the
    /// loop is assumed to never terminate.
    #[error(
        "maximum update depth exceeded: a fiber repeatedly scheduled synchronous \
         updates from inside a commit"
    )]
    NestedUpdateOverflow,

    /// An error unwound all the way to the root with no boundary willing to
    /// capture it. The render was discarded and its lanes marked suspended.
    #[error("fatal render error: {}", .value.description.as_deref().unwrap_or("<opaque>"))]
    FatalRender { value: CapturedValue },
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

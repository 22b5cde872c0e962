//! Items and the user-supplied functions applied to them

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ErrorPolicy;

/// Anything that can flow along a pipeline edge.
///
/// The serde bounds let every item cross a process boundary, so any
/// operator can be moved onto a process pool without changing its type.
pub trait Item: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Item for T where
    T: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A lazy, possibly unbounded, single-pass sequence of items
pub type ItemStream<T> = Box<dyn Iterator<Item = T> + Send>;

/// Longest item rendering kept in failure context
const CONTEXT_LIMIT: usize = 128;

/// Which user capability a transform wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformKind {
    /// One output per input
    Map,
    /// Zero or one output per input, keeping the input unchanged
    Filter,
    /// Consumes inputs and produces nothing
    Sink,
}

type Step<T> = dyn Fn(&T) -> anyhow::Result<Option<T>> + Send + Sync;

/// A named, cheaply clonable processing step
pub struct Transform<T> {
    name: Arc<str>,
    kind: TransformKind,
    step: Arc<Step<T>>,
}

impl<T> Clone for Transform<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            kind: self.kind,
            step: Arc::clone(&self.step),
        }
    }
}

impl<T> fmt::Debug for Transform<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Result of running a transform on one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Yielded<T> {
    /// The transform produced (or let through) a value
    Value(T),
    /// A filter rejected the item, or a sink consumed it
    Dropped,
    /// Every permitted attempt failed
    Failed(ItemFailure),
}

impl<T> Yielded<T> {
    /// The produced value, if any
    pub fn into_value(self) -> Option<T> {
        match self {
            Yielded::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// A failed item together with enough context to report it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Position of the item in the executor's input
    pub index: u64,

    /// Rendered error or panic message
    pub message: String,

    /// Number of attempts made
    pub attempts: u32,

    /// Truncated `Debug` rendering of the item
    pub context: String,

    /// Whether the failure was a wait that exceeded its bound
    pub timed_out: bool,
}

impl ItemFailure {
    /// A failure for an item whose result never arrived in time
    pub fn timed_out(index: u64, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
            attempts: 1,
            context: String::new(),
            timed_out: true,
        }
    }
}

impl<T: Item> Transform<T> {
    /// Wrap a fallible one-to-one function
    pub fn map<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: TransformKind::Map,
            step: Arc::new(move |item: &T| f(item).map(Some)),
        }
    }

    /// Wrap a predicate; only items for which it holds pass through
    pub fn filter<P>(name: impl Into<Arc<str>>, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: TransformKind::Filter,
            step: Arc::new(move |item: &T| Ok(predicate(item).then(|| item.clone()))),
        }
    }

    /// Wrap a consumer that produces no output
    pub fn sink<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: TransformKind::Sink,
            step: Arc::new(move |item: &T| f(item).map(|()| None)),
        }
    }

    /// Name of this transform
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the name
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Kind of this transform
    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    /// Apply the step once, turning a panic into an error
    pub fn apply(&self, item: &T) -> anyhow::Result<Option<T>> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.step)(item))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))),
        }
    }

    /// Apply the step with the retry budget of `policy`.
    ///
    /// Retries run immediately on the calling worker.
    pub fn run(&self, index: u64, item: &T, policy: &ErrorPolicy) -> Yielded<T> {
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.apply(item) {
                Ok(Some(value)) => return Yielded::Value(value),
                Ok(None) => return Yielded::Dropped,
                Err(err) if attempt < max_attempts => {
                    tracing::warn!(
                        transform = %self.name,
                        index,
                        attempt,
                        error = %err,
                        "retrying failed item"
                    );
                }
                Err(err) => {
                    return Yielded::Failed(ItemFailure {
                        index,
                        message: format!("{err:#}"),
                        attempts: attempt,
                        context: describe(item),
                        timed_out: false,
                    })
                }
            }
        }
    }
}

/// Truncated `Debug` rendering used as failure context
pub fn describe<T: fmt::Debug>(item: &T) -> String {
    let mut rendered = format!("{item:?}");
    if rendered.len() > CONTEXT_LIMIT {
        let mut cut = CONTEXT_LIMIT;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        rendered.truncate(cut);
        rendered.push_str("...");
    }
    rendered
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

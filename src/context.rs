//! Ambient tracing context.
//!
//! A [`TraceContext`] is an immutable value naming the currently active span.
//! The current context lives on a thread-local stack: [`TraceContext::attach`]
//! pushes and returns a guard token, dropping the guard restores the previous
//! context. Every exit path in the dispatch adapter restores the caller's
//! context through such a token before caller-supplied code runs again.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures::Stream;

use crate::span::Span;

thread_local! {
    static CURRENT: RefCell<Vec<TraceContext>> = const { RefCell::new(Vec::new()) };
}

/// An immutable snapshot of the ambient trace state: the active span, if any.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    span: Option<Span>,
}

impl TraceContext {
    /// Returns the current ambient context of this thread.
    ///
    /// With nothing attached this is the empty root context.
    pub fn current() -> TraceContext {
        CURRENT.with(|stack| stack.borrow().last().cloned().unwrap_or_default())
    }

    /// Returns a copy of this context with `span` as the active span.
    pub fn with_span(&self, span: Span) -> TraceContext {
        TraceContext { span: Some(span) }
    }

    /// Returns the active span, if any.
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    /// Make this context current until the returned guard is dropped.
    pub fn attach(&self) -> ContextGuard {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        ContextGuard {
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this context current, restoring the previous context
    /// afterwards.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.attach();
        f()
    }

    /// Re-bind a stream's emission to this context: every poll of the
    /// returned stream runs with this context current, so consumers observe
    /// it (and not whatever produced the stream) as ambient state.
    pub fn bind_stream<S: Stream + Unpin>(&self, stream: S) -> ContextStream<S> {
        ContextStream {
            context: self.clone(),
            inner: stream,
        }
    }
}

/// Restores the previously current context when dropped.
///
/// Guards are thread-bound and must be dropped in reverse attach order, which
/// scoped use via [`TraceContext::scope`] guarantees.
#[must_use = "dropping the guard restores the previous context"]
pub struct ContextGuard {
    // Contexts stack per thread; a guard moved across threads would pop the
    // wrong stack.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Stream combinator produced by [`TraceContext::bind_stream`].
pub struct ContextStream<S> {
    context: TraceContext,
    inner: S,
}

impl<S: Stream + Unpin> Stream for ContextStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let _guard = this.context.attach();
        Pin::new(&mut this.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

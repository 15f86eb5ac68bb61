//! Interceptor Chain (C6, §4.6): ordered, onion-model middleware wrapping
//! server dispatch. Composition is right-to-left so that, with
//! interceptors installed in order `[A, B]`, `A` is outermost: the
//! observed event order is `A-before -> B-before -> H -> B-after -> A-after`
//! (P3, S3).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::call_context::CallContext;
use crate::error::GrpcError;
use crate::message::MessageHandle;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The normalized outcome of a pipeline invocation (§4.4 step 3, §4.6): a
/// resolved response for unary-response modes, or a bare completion marker
/// for streaming-response modes whose payloads were already sent via
/// `call.send`.
#[derive(Clone)]
pub enum HandlerOutcome {
    Response(MessageHandle),
    Completed,
}

pub type DispatchResult = std::result::Result<HandlerOutcome, GrpcError>;

/// `(call) -> result | promise<result>` (§4.6): one link in the chain,
/// already bound to whatever is "next" in the composition.
pub type Pipeline = Arc<dyn Fn(Arc<CallContext>) -> BoxFuture<'static, DispatchResult> + Send + Sync>;

/// `(next) -> handler` (§3, §4.6). An interceptor's `next` is the inner
/// pipeline; calling it behaves exactly like `await`ing it (§5).
///
/// Note on §4.6's "an interceptor that does not call `next` must produce
/// its own outcome; if it returns undefined without calling `next`, the
/// call fails with INTERNAL": that specific failure mode is a property of
/// dynamically-typed JS interceptor functions and is enforced at the
/// script-engine binding, not here — a native `Interceptor` impl always
/// produces a [`DispatchResult`] by construction.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn call(&self, call: Arc<CallContext>, next: Pipeline) -> DispatchResult;
}

/// Compose an ordered list of interceptors around an innermost pipeline
/// (§4.4 step 3: "the innermost inner is a function that invokes the
/// actual JS handler ... Each interceptor wraps this with its own logic").
pub fn compose(interceptors: &[Arc<dyn Interceptor>], innermost: Pipeline) -> Pipeline {
    let mut pipeline = innermost;
    for interceptor in interceptors.iter().rev() {
        let interceptor = interceptor.clone();
        let inner = pipeline.clone();
        pipeline = Arc::new(move |call: Arc<CallContext>| {
            let interceptor = interceptor.clone();
            let inner = inner.clone();
            Box::pin(async move { interceptor.call(call, inner).await }) as BoxFuture<'static, DispatchResult>
        });
    }
    pipeline
}

/// Adapts a plain async closure into an [`Interceptor`], for composing
/// interceptors out of ordinary functions (the shape `addInterceptor(fn)`
/// takes at the JS boundary; used throughout this crate's own tests).
struct FnInterceptor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Interceptor for FnInterceptor<F>
where
    F: Fn(Arc<CallContext>, Pipeline) -> Fut + Send + Sync,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    async fn call(&self, call: Arc<CallContext>, next: Pipeline) -> DispatchResult {
        (self.f)(call, next).await
    }
}

pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(Arc<CallContext>, Pipeline) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    Arc::new(FnInterceptor { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use crate::stream::Cancellation;
    use std::sync::Mutex;

    fn test_call() -> Arc<CallContext> {
        Arc::new(CallContext::new(
            "/testgrpc.TestService/Echo".to_string(),
            None,
            None,
            None,
            None,
            None,
            Cancellation::new(),
        ))
    }

    fn handler_pushing(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> Pipeline {
        Arc::new(move |_call| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(label.to_string());
                Ok(HandlerOutcome::Completed)
            })
        })
    }

    fn logging_interceptor(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn Interceptor> {
        from_fn(move |call, next| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{name}-before:{}", call.method()));
                let result = next(call.clone()).await;
                log.lock().unwrap().push(format!("{name}-after:{}", call.method()));
                result
            }
        })
    }

    #[tokio::test]
    async fn p3_onion_order_two_interceptors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = handler_pushing(log.clone(), "handler");
        let interceptors: Vec<Arc<dyn Interceptor>> =
            vec![logging_interceptor(log.clone(), "A"), logging_interceptor(log.clone(), "B")];
        let pipeline = compose(&interceptors, handler);
        pipeline(test_call()).await.unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "A-before:/testgrpc.TestService/Echo".to_string(),
                "B-before:/testgrpc.TestService/Echo".to_string(),
                "handler".to_string(),
                "B-after:/testgrpc.TestService/Echo".to_string(),
                "A-after:/testgrpc.TestService/Echo".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn s3_three_word_onion_labels() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Pipeline = Arc::new({
            let log = log.clone();
            move |_call| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push("handler".to_string());
                    Ok(HandlerOutcome::Completed)
                })
            }
        });
        let first = from_fn({
            let log = log.clone();
            move |call, next| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("first-before".to_string());
                    let r = next(call).await;
                    log.lock().unwrap().push("first-after".to_string());
                    r
                }
            }
        });
        let second = from_fn({
            let log = log.clone();
            move |call, next| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("second-before".to_string());
                    let r = next(call).await;
                    log.lock().unwrap().push("second-after".to_string());
                    r
                }
            }
        });
        let pipeline = compose(&[first, second], handler);
        pipeline(test_call()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first-before", "second-before", "handler", "second-after", "first-after"]
        );
    }

    #[tokio::test]
    async fn p8_s4_error_remapping_interceptor() {
        let handler: Pipeline = Arc::new(|_call| {
            Box::pin(async { Err(GrpcError::new(StatusCode::Unknown, "something broke")) })
        });
        let remap = from_fn(|call, next| async move {
            match next(call).await {
                Err(e) => Err(GrpcError::new(
                    StatusCode::PermissionDenied,
                    format!("access denied: {}", e.message),
                )),
                ok => ok,
            }
        });
        let pipeline = compose(&[remap], handler);
        let err = pipeline(test_call()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::PermissionDenied);
        assert!(err.message.contains("access denied"));
        assert!(err.message.contains("something broke"));
    }

    #[tokio::test]
    async fn p9_short_circuit_before_handler_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = handler_pushing(log.clone(), "handler-should-not-run");
        let gate = from_fn(|_call, _next| async {
            Err(GrpcError::new(StatusCode::Unauthenticated, "missing x-auth"))
        });
        let pipeline = compose(&[gate], handler);
        let err = pipeline(test_call()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unauthenticated);
        assert!(log.lock().unwrap().is_empty());
    }
}

//! Relayed HTTP request handling.
//!
//! `request` commands arrive over the control channel; the user request
//! handler fills in the response, which goes back as a `response` frame
//! followed by the buffered body as one binary frame. Responses larger
//! than a control frame would switch to a rendezvous transport; that
//! path is out of scope here and bodies are bounded by the control
//! frame limit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use hc_common::RelayResult;
use hc_protocol::{ListenerCommand, RequestCommand, ResponseCommand};

use crate::address;
use crate::context::ListenerContext;
use crate::control::ControlConnection;
use crate::listener::RequestHandler;
use crate::tracking::TrackingContext;

/// Dispatches one relayed request and sends the response frame.
pub(crate) async fn handle_request(
    address: &Url,
    control: &ControlConnection,
    handler: Option<RequestHandler>,
    command: RequestCommand,
    body: Option<Vec<u8>>,
    timeout: Duration,
) -> RelayResult<()> {
    let uri = address::request_target_uri(address, &command.request_target)?;
    let tracking = Arc::new(TrackingContext::with_tracking_id(
        command.id.clone(),
        uri.as_str(),
    ));
    let mut context =
        ListenerContext::for_request(tracking, uri, command.method.clone(), command.headers.clone(), body);

    apply_handler(&mut context, handler);

    let response = context.response();
    let body = (!response.body.is_empty()).then(|| response.body.clone());
    let frame = ListenerCommand::Response(ResponseCommand {
        request_id: command.id,
        status_code: response.status_code,
        status_description: response.status_description.clone(),
        headers: response.headers.clone(),
        body: body.is_some(),
    });
    control.send_command(&frame, body, timeout).await
}

/// Runs the user handler against the context. A missing handler yields
/// `503`; a panicking handler yields `500` with the tracking id, and the
/// listener stays online.
fn apply_handler(context: &mut ListenerContext, handler: Option<RequestHandler>) {
    let Some(handler) = handler else {
        context
            .response_mut()
            .set_status(503, "No request handler is registered on the listener");
        return;
    };

    if catch_unwind(AssertUnwindSafe(|| handler(context))).is_err() {
        let description = format!(
            "The listener's request handler failed. TrackingId: {}",
            context.tracking().tracking_id()
        );
        tracing::warn!(tracking_id = %context.tracking().tracking_id(), "request handler panicked");
        let response = context.response_mut();
        response.set_status(500, description);
        response.headers.clear();
        response.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request_context() -> ListenerContext {
        let uri = Url::parse("sb://ns.example.net/demo?a=1").unwrap();
        let tracking = Arc::new(TrackingContext::with_tracking_id("req-1", uri.as_str()));
        ListenerContext::for_request(tracking, uri, "GET".into(), HashMap::new(), None)
    }

    #[test]
    fn missing_handler_yields_503() {
        let mut context = request_context();
        apply_handler(&mut context, None);
        assert_eq!(context.response().status_code, 503);
    }

    #[test]
    fn handler_controls_status_and_body() {
        let mut context = request_context();
        let handler: RequestHandler = Arc::new(|ctx| {
            let response = ctx.response_mut();
            response.set_status(202, "Accepted");
            response.body.push(0);
        });
        apply_handler(&mut context, Some(handler));
        assert_eq!(context.response().status_code, 202);
        assert_eq!(context.response().body, vec![0]);
    }

    #[test]
    fn panicking_handler_yields_500_with_tracking_id() {
        let mut context = request_context();
        let handler: RequestHandler = Arc::new(|_| panic!("handler exploded"));
        apply_handler(&mut context, Some(handler));
        assert_eq!(context.response().status_code, 500);
        assert!(context
            .response()
            .status_description
            .contains("TrackingId: req-1"));
        assert!(context.response().body.is_empty());
    }
}

use axum::{
    body::Body,
    http::{Response as HttpResponse, StatusCode},
    response::Response,
};
use indexserver_protocol::{serialize_json, ErrorEnvelope};
use serde::Serialize;

fn respond(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response {
    let mut response = HttpResponse::new(Body::from(body));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert("content-type", value);
    }
    response
}

pub(crate) fn text_response(text: String) -> Response {
    respond(StatusCode::OK, "text/plain; charset=utf-8", text.into_bytes())
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serialize_json(value) {
        Ok(raw) => respond(status, "application/json", raw.into_bytes()),
        Err(err) => {
            log::error!("Failed to serialize response: {err}");
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                b"internal error".to_vec(),
            )
        }
    }
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    let hint = match code {
        "not_found" => "Known routes: /debug/queue, /debug/shards, /health",
        _ => "Check the index server logs for details.",
    };
    json_response(status, &ErrorEnvelope::new(code, message).with_hint(hint))
}

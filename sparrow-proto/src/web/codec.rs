use anyhow::Result;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, COOKIE, LOCATION};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::error::FormError;

pub(super) type HttpResponse = Response<BoxBody<Bytes, std::io::Error>>;

/// Forms are a handful of fields, sieve scripts being the largest.
const MAX_FORM_BYTES: usize = 256 * 1024;

pub(crate) fn text_body(txt: &'static str) -> BoxBody<Bytes, std::io::Error> {
    BoxBody::new(Full::new(Bytes::from(txt)).map_err(|e| match e {}))
}

pub(crate) fn html_body(html: String) -> BoxBody<Bytes, std::io::Error> {
    BoxBody::new(Full::new(Bytes::from(html)).map_err(|e| match e {}))
}

pub(crate) fn html(status: StatusCode, page: String) -> Result<HttpResponse> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(html_body(page))?)
}

/// 303, so that the browser follows with a GET after a form POST.
pub(crate) fn redirect(location: &str) -> Result<HttpResponse> {
    Ok(Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(LOCATION, location)
        .body(text_body(""))?)
}

/// Value of cookie `name` among all `Cookie` headers of the request.
pub(crate) fn cookie<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|hv| hv.to_str().ok())
        .flat_map(|hv| hv.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_string())
}

/// Decode an `application/x-www-form-urlencoded` body.
pub(crate) async fn read_form<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, FormError> {
    let collected = match Limited::new(req.into_body(), MAX_FORM_BYTES).collect().await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(err=?e, "unable to read form body");
            return Err(FormError::wrong("The submitted form is too large or incomplete"));
        }
    };
    decode_form(&collected.to_bytes())
}

pub(crate) fn decode_form<T: DeserializeOwned>(raw: &[u8]) -> Result<T, FormError> {
    serde_urlencoded::from_bytes(raw).map_err(|e| {
        tracing::warn!(err=%e, "malformed form");
        FormError::tampered()
    })
}

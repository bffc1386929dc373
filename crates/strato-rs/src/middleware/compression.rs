//! Response compression: negotiation stage + body encoding.
//!
//! The stage only negotiates — it inspects `Accept-Encoding` and marks the
//! response with the chosen codec. The actual encoding happens in the
//! dispatcher once the final body is known, because the body may come from
//! a handler, the cache or the 404 renderer.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::context::{Encoding, Request, Response};
use crate::models::error::AppError;
use actix_web::web::Bytes;
use async_trait::async_trait;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use log::debug;
use std::io::Write;

pub struct CompressionStage {
    threshold: usize,
}

impl CompressionStage {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

/// Picks the first supported codec from an `Accept-Encoding` value.
fn negotiate(accept_encoding: &str) -> Option<Encoding> {
    for token in accept_encoding.split(',') {
        let name = token.split(';').next().unwrap_or("").trim();
        match name {
            "gzip" | "*" => return Some(Encoding::Gzip),
            "deflate" => return Some(Encoding::Deflate),
            _ => {}
        }
    }
    None
}

#[async_trait]
impl PipelineStage for CompressionStage {
    fn id(&self) -> &'static str {
        "compression"
    }

    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<StageFlow, AppError> {
        if let Some(accept) = req.header("accept-encoding") {
            if let Some(encoding) = negotiate(accept) {
                res.encoding = Some(encoding);
            }
        }
        Ok(StageFlow::Next)
    }
}

/// Encodes the final body in place when negotiation picked a codec and the
/// body clears the size threshold. A body that fails to shrink is left
/// unencoded.
pub fn apply_compression(res: &mut Response, threshold: usize) {
    let Some(encoding) = res.encoding else {
        return;
    };
    if res.header("content-encoding").is_some() {
        return;
    }
    let Some(body) = res.body() else {
        return;
    };
    if body.len() < threshold {
        return;
    }

    let compressed: std::io::Result<Vec<u8>> = match encoding {
        Encoding::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(body).and_then(|_| enc.finish())
        }
        Encoding::Deflate => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(body).and_then(|_| enc.finish())
        }
    };

    match compressed {
        Ok(out) if out.len() < body.len() => {
            debug!(
                "compression: {} {} -> {} bytes",
                encoding.as_str(),
                body.len(),
                out.len()
            );
            res.replace_body(Bytes::from(out));
            res.force_header("Content-Encoding", encoding.as_str());
            res.force_header("Vary", "Accept-Encoding");
        }
        Ok(_) => debug!("compression: body did not shrink, sending identity"),
        Err(e) => debug!("compression: encoder failed, sending identity: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::Method;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[tokio::test]
    async fn negotiation_follows_client_preference_order() {
        let stage = CompressionStage::new(16);
        let mut req =
            Request::new(Method::Get, "/").with_header("Accept-Encoding", "deflate, gzip;q=0.8");
        let mut res = Response::new();
        stage.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(res.encoding, Some(Encoding::Deflate));

        let mut req = Request::new(Method::Get, "/").with_header("Accept-Encoding", "gzip, br");
        let mut res = Response::new();
        stage.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(res.encoding, Some(Encoding::Gzip));
    }

    #[tokio::test]
    async fn no_header_means_identity() {
        let stage = CompressionStage::new(16);
        let mut req = Request::new(Method::Get, "/");
        let mut res = Response::new();
        stage.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(res.encoding, None);
    }

    #[test]
    fn bodies_below_threshold_stay_raw() {
        let mut res = Response::new();
        res.encoding = Some(Encoding::Gzip);
        res.send_text("tiny").unwrap();
        apply_compression(&mut res, 1024);
        assert!(res.header("content-encoding").is_none());
        assert_eq!(&res.body().unwrap()[..], b"tiny");
    }

    #[test]
    fn large_bodies_are_gzip_encoded() {
        let mut res = Response::new();
        res.encoding = Some(Encoding::Gzip);
        let body = "abcdefgh".repeat(512);
        res.send_text(body.clone()).unwrap();
        apply_compression(&mut res, 1024);
        assert_eq!(res.header("content-encoding"), Some("gzip"));
        assert_eq!(res.header("vary"), Some("Accept-Encoding"));

        let mut decoder = GzDecoder::new(&res.body().unwrap()[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, body);
    }
}

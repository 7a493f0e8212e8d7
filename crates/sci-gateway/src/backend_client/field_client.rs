//! Aerodynamic field prediction.
//!
//! The geometry is a remote point cloud (one `x y z` row per point). It is
//! downloaded, packed as little-endian f32 triples, base64 encoded and
//! uploaded together with the flow conditions as a multipart form.

use async_trait::async_trait;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::debug;

use super::http::{build_http_client, check_status, map_transport_error, read_json, probe_url};
use super::{BackendClient, BackendError, BackendPayload, BackendReply};
use crate::domain::{IntentParams, Vector3};
use crate::registry::{BackendDescriptor, Protocol};

const DEFAULT_TRAIN_SPEED: f64 = 75.0;
/// Strings longer than this (rendered images, raw fields) are elided from
/// the answer text.
const MAX_INLINE_STRING: usize = 2048;
/// Upper bound on a downloaded point cloud.
const MAX_GEOMETRY_BYTES: usize = 16 * 1024 * 1024;

pub struct FieldClient {
    id: String,
    base_url: String,
    timeout: Duration,
    max_geometry_bytes: usize,
    http: reqwest::Client,
}

impl FieldClient {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            base_url: descriptor.endpoint.clone(),
            timeout: descriptor.timeout(),
            max_geometry_bytes: MAX_GEOMETRY_BYTES,
            http: build_http_client(descriptor.timeout()),
        }
    }

    async fn fetch_geometry(&self, url: &str) -> Result<String, BackendError> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BackendError::InvalidPayload(format!("geometry download failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(BackendError::InvalidPayload(format!(
                "geometry download returned {}",
                response.status()
            )));
        }
        let too_large = || {
            BackendError::InvalidPayload(format!("geometry exceeds {} bytes", self.max_geometry_bytes))
        };
        if response.content_length().is_some_and(|len| len > self.max_geometry_bytes as u64) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BackendError::InvalidPayload(format!("geometry body unreadable: {}", e)))?
        {
            if body.len() + chunk.len() > self.max_geometry_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        String::from_utf8(body).map_err(|e| BackendError::InvalidPayload(format!("geometry is not UTF-8 text: {}", e)))
    }
}

/// Parse a point cloud, keeping the first three columns of each row.
pub fn parse_point_cloud(text: &str) -> Result<Vec<[f32; 3]>, BackendError> {
    let mut points = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values: Vec<f32> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .take(3)
            .map(|s| s.parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|e| BackendError::InvalidPayload(format!("geometry line {}: {}", line_no + 1, e)))?;
        if values.len() < 3 {
            return Err(BackendError::InvalidPayload(format!(
                "geometry line {} has {} columns, expected 3",
                line_no + 1,
                values.len()
            )));
        }
        points.push([values[0], values[1], values[2]]);
    }
    if points.is_empty() {
        return Err(BackendError::InvalidPayload("geometry contains no points".to_string()));
    }
    Ok(points)
}

pub fn encode_point_cloud(points: &[[f32; 3]]) -> String {
    let mut raw = Vec::with_capacity(points.len() * 12);
    for point in points {
        for value in point {
            raw.extend_from_slice(&value.to_le_bytes());
        }
    }
    base64::engine::general_purpose::STANDARD.encode(raw)
}

fn elide_long_strings(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) if s.len() > MAX_INLINE_STRING => {
            *s = format!("<{} bytes omitted>", s.len());
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(elide_long_strings),
        serde_json::Value::Object(map) => map.values_mut().for_each(elide_long_strings),
        _ => {}
    }
}

#[async_trait]
impl BackendClient for FieldClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::FieldPredict
    }

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError> {
        let IntentParams::Field { geometry_url, velocity, wind } = &payload.params else {
            return Err(BackendError::InvalidPayload(format!(
                "field predictor cannot serve task {}",
                payload.params.task_name()
            )));
        };
        let geometry_url = geometry_url
            .as_deref()
            .ok_or_else(|| BackendError::InvalidPayload("geometry URL is required".to_string()))?;
        let velocity = velocity.unwrap_or(Vector3::new(DEFAULT_TRAIN_SPEED, 0.0, 0.0));
        let wind = wind.unwrap_or(Vector3::new(0.0, 0.0, 0.0));

        let points = parse_point_cloud(&self.fetch_geometry(geometry_url).await?)?;
        debug!("Field client {} uploading {} geometry points", self.id, points.len());

        let geometry = Part::bytes(encode_point_cloud(&points).into_bytes())
            .file_name("geometry.txt")
            .mime_str("text/plain")
            .map_err(|e| BackendError::InvalidPayload(e.to_string()))?;
        let form = Form::new()
            .text("train_speed", velocity.x.to_string())
            .text("wind_speed_y", wind.y.to_string())
            .text("wind_speed_z", wind.z.to_string())
            .part("geometry", geometry);

        let response = self
            .http
            .post(format!("{}/api/v1/predict", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;
        let mut result: serde_json::Value = read_json(check_status(response).await?).await?;
        elide_long_strings(&mut result);

        let lead = format!(
            "Aerodynamic field prediction for {} geometry points at {} m/s (crosswind {} m/s, vertical wind {} m/s).",
            points.len(),
            velocity.x,
            wind.y,
            wind.z
        );
        Ok(BackendReply::structured(lead, result))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}{}", self.base_url, Protocol::FieldPredict.probe_path());
        probe_url(&self.http, &url, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use std::io::Write;

    #[test]
    fn test_point_cloud_keeps_three_columns() {
        let points = parse_point_cloud("# header\n0 0 0 9\n1.5 2 3\n\n4,5,6\n").unwrap();
        assert_eq!(points, vec![[0.0, 0.0, 0.0], [1.5, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_point_cloud_rejects_short_rows() {
        assert!(parse_point_cloud("1 2\n").is_err());
        assert!(parse_point_cloud("a b c\n").is_err());
        assert!(parse_point_cloud("\n\n").is_err());
    }

    #[test]
    fn test_encoding_is_little_endian_f32() {
        let encoded = encode_point_cloud(&[[1.0, 0.0, 0.0]]);
        let raw = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(raw.len(), 12);
        assert_eq!(&raw[0..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_long_strings_are_elided() {
        let mut value = serde_json::json!({"cd": 0.31, "image": "x".repeat(5000)});
        elide_long_strings(&mut value);
        assert_eq!(value["cd"], 0.31);
        assert_eq!(value["image"], "<5000 bytes omitted>");
    }

    #[tokio::test]
    async fn test_predict_uploads_geometry() {
        let mut server = mockito::Server::new_async().await;
        let _geometry = server
            .mock("GET", "/geom.txt")
            .with_status(200)
            .with_body("0 0 0\n1 1 1\n")
            .create_async()
            .await;
        let predict = server
            .mock("POST", "/api/v1/predict")
            .match_body(mockito::Matcher::Regex("train_speed".to_string()))
            .with_status(200)
            .with_body(r#"{"drag_coefficient":0.28,"lift_coefficient":0.02}"#)
            .create_async()
            .await;

        let descriptor = BackendDescriptor::new("field", Domain::FieldSimulation, server.url(), Protocol::FieldPredict);
        let mut payload = BackendPayload::chat(Vec::new());
        payload.params = IntentParams::Field {
            geometry_url: Some(format!("{}/geom.txt", server.url())),
            velocity: Some(Vector3::new(83.3, 0.0, 0.0)),
            wind: None,
        };
        let reply = FieldClient::new(&descriptor).invoke(&payload).await.unwrap();

        predict.assert_async().await;
        assert!(reply.content.contains("2 geometry points"));
        assert_eq!(reply.metadata.unwrap()["drag_coefficient"], 0.28);
    }

    // ===== Geometry download =====

    #[tokio::test]
    async fn test_oversized_geometry_is_refused() {
        let mut server = mockito::Server::new_async().await;
        let _sized = server
            .mock("GET", "/sized.txt")
            .with_status(200)
            .with_body("0 0 0\n".repeat(20))
            .create_async()
            .await;
        let _chunked = server
            .mock("GET", "/chunked.txt")
            .with_status(200)
            .with_chunked_body(|w| {
                for _ in 0..20 {
                    w.write_all(b"1 1 1\n")?;
                }
                Ok(())
            })
            .create_async()
            .await;

        let descriptor = BackendDescriptor::new("field", Domain::FieldSimulation, server.url(), Protocol::FieldPredict);
        let mut client = FieldClient::new(&descriptor);
        client.max_geometry_bytes = 64;

        for path in ["/sized.txt", "/chunked.txt"] {
            let err = client.fetch_geometry(&format!("{}{}", server.url(), path)).await.unwrap_err();
            assert!(matches!(err, BackendError::InvalidPayload(ref msg) if msg.contains("exceeds")), "{}: {:?}", path, err);
        }

        client.max_geometry_bytes = 1024;
        let text = client.fetch_geometry(&format!("{}/chunked.txt", server.url())).await.unwrap();
        assert_eq!(parse_point_cloud(&text).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_missing_geometry_url_is_invalid() {
        let descriptor =
            BackendDescriptor::new("field", Domain::FieldSimulation, "http://127.0.0.1:1", Protocol::FieldPredict);
        let mut payload = BackendPayload::chat(Vec::new());
        payload.params = IntentParams::Field { geometry_url: None, velocity: None, wind: None };
        let err = FieldClient::new(&descriptor).invoke(&payload).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidPayload(_)));
    }
}

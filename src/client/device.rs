#![forbid(unsafe_code)]

// Capability negotiation for the local endpoint.
//
// Loads the router's advertised capability set, intersects it with the
// codecs this endpoint can handle, and hands out the negotiated parameters
// used for produce and consume calls.

use super::error::ClientError;
use crate::engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use serde_json::{json, Value};

/// Codecs the endpoint supports out of the box.
const DEFAULT_SUPPORTED: &[&str] = &["audio/opus", "video/vp8"];

pub struct Device {
    supported_mime_types: Vec<String>,
    /// Router codecs that survived the intersection; None until loaded.
    negotiated: Option<Vec<Value>>,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    pub fn new() -> Self {
        Self {
            supported_mime_types: DEFAULT_SUPPORTED.iter().map(|s| s.to_string()).collect(),
            negotiated: None,
        }
    }

    #[cfg(test)]
    pub fn with_supported(mime_types: &[&str]) -> Self {
        Self {
            supported_mime_types: mime_types.iter().map(|s| s.to_string()).collect(),
            negotiated: None,
        }
    }

    /// Loads the router's capability set. Fails when no router codec is
    /// supported locally, which is fatal to the join attempt.
    pub fn load(&mut self, router_capabilities: &RtpCapabilities) -> Result<(), ClientError> {
        let codecs = router_capabilities
            .0
            .get("codecs")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        let negotiated: Vec<Value> = codecs
            .into_iter()
            .filter(|codec| {
                codec
                    .get("mimeType")
                    .and_then(|m| m.as_str())
                    .map(|m| {
                        let mime = m.to_ascii_lowercase();
                        self.supported_mime_types.contains(&mime)
                    })
                    .unwrap_or(false)
            })
            .collect();

        if negotiated.is_empty() {
            return Err(ClientError::Incompatible(
                "no common codec with the router".to_string(),
            ));
        }

        self.negotiated = Some(negotiated);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.negotiated.is_some()
    }

    /// Capability set to send with consume requests.
    pub fn rtp_capabilities(&self) -> Result<RtpCapabilities, ClientError> {
        let negotiated = self.require_loaded()?;
        Ok(RtpCapabilities(json!({
            "codecs": negotiated,
            "headerExtensions": [],
        })))
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.negotiated
            .as_deref()
            .map(|codecs| codecs.iter().any(|c| codec_kind_matches(c, kind)))
            .unwrap_or(false)
    }

    /// Send parameters for a local track of the given kind.
    pub fn rtp_parameters_for(&self, kind: MediaKind) -> Result<RtpParameters, ClientError> {
        let negotiated = self.require_loaded()?;
        let codec = negotiated
            .iter()
            .find(|c| codec_kind_matches(c, kind))
            .ok_or_else(|| ClientError::Incompatible(format!("no negotiated {kind} codec")))?;
        Ok(RtpParameters(json!({ "codecs": [codec] })))
    }

    /// DTLS parameters for the transport connect handshake. The engine
    /// treats these as an opaque blob.
    pub fn dtls_parameters(&self) -> DtlsParameters {
        DtlsParameters(json!({ "role": "auto", "fingerprints": [] }))
    }

    fn require_loaded(&self) -> Result<&[Value], ClientError> {
        self.negotiated
            .as_deref()
            .ok_or(ClientError::InvalidState("device is not loaded"))
    }
}

fn codec_kind_matches(codec: &Value, kind: MediaKind) -> bool {
    let prefix = match kind {
        MediaKind::Audio => "audio/",
        MediaKind::Video => "video/",
    };
    codec
        .get("mimeType")
        .and_then(|m| m.as_str())
        .map(|m| m.to_ascii_lowercase().starts_with(prefix))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_caps() -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
            ],
            "headerExtensions": [],
        }))
    }

    #[test]
    fn load_keeps_common_codecs_case_insensitively() {
        let mut device = Device::new();
        device.load(&router_caps()).unwrap();
        assert!(device.can_produce(MediaKind::Audio));
        assert!(device.can_produce(MediaKind::Video));
    }

    #[test]
    fn load_fails_without_codec_overlap() {
        let mut device = Device::with_supported(&["video/h264"]);
        let err = device.load(&router_caps()).unwrap_err();
        assert!(matches!(err, ClientError::Incompatible(_)));
        assert!(!device.is_loaded());
    }

    #[test]
    fn parameters_carry_the_negotiated_codec() {
        let mut device = Device::new();
        device.load(&router_caps()).unwrap();
        let params = device.rtp_parameters_for(MediaKind::Video).unwrap();
        let mime = params.0["codecs"][0]["mimeType"].as_str().unwrap();
        assert_eq!(mime.to_ascii_lowercase(), "video/vp8");
    }

    #[test]
    fn unloaded_device_refuses_parameters() {
        let device = Device::new();
        assert!(matches!(
            device.rtp_capabilities(),
            Err(ClientError::InvalidState(_))
        ));
    }
}

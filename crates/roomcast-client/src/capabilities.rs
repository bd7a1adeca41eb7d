//! Capability negotiation against the router
//!
//! Runs before any transport work; every later operation carries the
//! capabilities produced here.

use roomcast_protocol::{RtpCapabilities, RtpCodecCapability};

use crate::engine::MediaEngine;
use crate::error::{Result, SessionError};

pub struct CapabilityNegotiator;

impl CapabilityNegotiator {
    /// Load local capabilities through the engine and verify at least one
    /// codec is usable with the router
    pub async fn negotiate(
        engine: &dyn MediaEngine,
        router: &RtpCapabilities,
    ) -> Result<RtpCapabilities> {
        let local = engine
            .load_capabilities(router)
            .await
            .map_err(|e| SessionError::CapabilityLoadFailed(e.to_string()))?;

        let compatible = local
            .codecs
            .iter()
            .any(|l| router.codecs.iter().any(|r| codec_compatible(l, r)));
        if !compatible {
            return Err(SessionError::UnsupportedRouter);
        }

        tracing::info!(
            "negotiated {} local codecs against {} router codecs",
            local.codecs.len(),
            router.codecs.len()
        );
        Ok(local)
    }
}

fn codec_compatible(a: &RtpCodecCapability, b: &RtpCodecCapability) -> bool {
    a.mime_type.eq_ignore_ascii_case(&b.mime_type) && a.clock_rate == b.clock_rate
}

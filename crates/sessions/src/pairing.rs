//! Pairing-code rendering.

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    qrcode::{QrCode, render::svg},
};

/// Render a pairing code as a scannable QR image in a `data:` URL.
pub fn qr_data_url(code: &str) -> Result<String, qrcode::types::QrError> {
    let svg = QrCode::new(code.as_bytes())?
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .quiet_zone(true)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)))
}

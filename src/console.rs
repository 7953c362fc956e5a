// ABOUTME: Operator-facing output for the login flows
// ABOUTME: Renders QR payloads as terminal blocks and prints pairing codes on stderr

use anyhow::{anyhow, Result};

/// Render a QR login payload into terminal-friendly text
pub fn render_qr(payload: &str) -> Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let qr = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode QR payload: {err}"))?;

    Ok(qr
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

/// Show a QR login payload. Falls back to the raw payload if rendering fails.
///
/// Login secrets go to stderr only, never through tracing, so they stay out
/// of the log files.
pub fn show_qr(payload: &str) {
    tracing::info!("QR code received (scan with the phone app > Linked Devices)");
    match render_qr(payload) {
        Ok(rendered) => {
            eprintln!();
            eprintln!("Scan this QR code in the phone app > Linked Devices:");
            eprintln!("{rendered}");
            eprintln!();
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to render QR code in terminal");
            eprintln!("QR payload: {payload}");
        }
    }
}

/// Show a formatted pairing code on stderr
pub fn show_pairing_code(code: &str) {
    tracing::info!("Pairing code issued");
    eprintln!();
    eprintln!("Pairing code: {code}");
    eprintln!("Enter it in the phone app > Linked Devices > Link with phone number.");
    eprintln!();
}

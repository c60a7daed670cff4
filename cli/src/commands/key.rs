use anyhow::{Context, Result};
use qrcode::QrCode;

use glico_core::service::GlicoService;

use super::helpers::print_json;

pub(crate) fn cmd_key_show(svc: &GlicoService, qr: bool, json: bool) -> Result<()> {
    let key = svc.identity_key()?;
    if json {
        return print_json(&serde_json::json!({
            "identityKey": key.as_str(),
            "formatted": key.formatted(),
        }));
    }
    println!("{}", key.formatted());
    eprintln!("Keep this key safe. Use `glico recover <key>` on a new device to restore your log.");
    if qr {
        eprint!("{}", render_qr(key.as_str())?);
    }
    Ok(())
}

/// Render a compact QR code using Unicode half-block characters.
///
/// Each character encodes two vertical modules, halving the output height.
fn render_qr(data: &str) -> Result<String> {
    let code = QrCode::new(data.as_bytes()).context("Failed to generate QR code")?;

    let width = code.width();
    let colors: Vec<bool> = code
        .into_colors()
        .into_iter()
        .map(|c| c == qrcode::Color::Dark)
        .collect();

    // 1-module quiet zone on each side
    let quiet = 1;
    let total = width + 2 * quiet;

    let is_dark = |row: usize, col: usize| -> bool {
        if row < quiet || row >= quiet + width || col < quiet || col >= quiet + width {
            return false;
        }
        colors[(row - quiet) * width + (col - quiet)]
    };

    let mut out = String::from("\n");
    for row in (0..total).step_by(2) {
        for col in 0..total {
            let top = is_dark(row, col);
            let bot = row + 1 < total && is_dark(row + 1, col);
            out.push(match (top, bot) {
                (true, true) => '\u{2588}',  // █
                (true, false) => '\u{2580}', // ▀
                (false, true) => '\u{2584}', // ▄
                (false, false) => ' ',
            });
        }
        out.push('\n');
    }
    out.push('\n');
    Ok(out)
}

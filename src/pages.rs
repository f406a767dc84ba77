//! HTML for the upload form.
//!
//! The page comes from a template file with a `{{ flash }}` placeholder.
//! When the template cannot be read the inline [`FALLBACK_PAGE`] is served
//! instead; both post a single `file` field to `/upload`.

use std::path::Path;
use tracing::warn;

use crate::flash::{MessageKind, ResultMessage};

/// Placeholder replaced by the rendered flash message.
pub const FLASH_PLACEHOLDER: &str = "{{ flash }}";

/// Inline page used when the template is unavailable.
pub const FALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>File Upload</title></head>
<body style="font-family: Arial; max-width: 600px; margin: 50px auto; padding: 20px;">
    <h1>File Upload to Azure Blob Storage</h1>
    <p>Managed Identity Authentication</p>
    {{ flash }}
    <form method="POST" action="/upload" enctype="multipart/form-data">
        <input type="file" name="file" required style="margin: 20px 0;">
        <br>
        <button type="submit"
            style="padding: 10px 20px; background: #0078d4; color: white; border: none; cursor: pointer;">
            Upload to Azure
        </button>
    </form>
</body>
</html>"#;

/// Read the page template, or `None` if it is missing or unreadable.
pub async fn load_template<P: AsRef<Path>>(path: P) -> Option<String> {
    match tokio::fs::read_to_string(path.as_ref()).await {
        Ok(contents) => Some(contents),
        Err(e) => {
            warn!(
                "Template {} unavailable ({}), serving inline form",
                path.as_ref().display(),
                e
            );
            None
        }
    }
}

/// Render the form page with an optional flash message.
pub fn render_index(template: Option<&str>, flash: Option<&ResultMessage>) -> String {
    let page = template.unwrap_or(FALLBACK_PAGE);
    let rendered_flash = flash.map(render_flash).unwrap_or_default();
    page.replace(FLASH_PLACEHOLDER, &rendered_flash)
}

fn render_flash(message: &ResultMessage) -> String {
    let (class, color) = match message.kind {
        MessageKind::Success => ("success", "green"),
        MessageKind::Error => ("error", "#c00"),
    };
    format!(
        r#"<p class="flash flash-{}" style="color: {};">{}</p>"#,
        class,
        color,
        escape_html(&message.text)
    )
}

/// Escape text for inclusion in HTML element content or attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

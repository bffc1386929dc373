//! The 404 renderer.
//!
//! Enabled mode returns a themed HTML page carrying the error code, the
//! requested path and the optional redirect/back/contact links. Disabled
//! mode answers plain `Cannot <METHOD> <PATH>`.

use crate::models::config::NotFoundSection;
use crate::models::context::Response;
use crate::models::route::Method;

/// Escapes user-controlled text before HTML interpolation.
fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn theme_colors(theme: &str) -> (&'static str, &'static str, &'static str) {
    match theme {
        "light" => ("#f5f5f5", "#1a1a1a", "#3b82f6"),
        _ => ("#0f1115", "#e7e7e7", "#60a5fa"),
    }
}

/// Builds the 404 response for a request that matched no route.
pub fn render_not_found(config: &NotFoundSection, method: Method, path: &str) -> Response {
    let mut res = Response::new();
    let _ = res.set_status(404);

    if !config.enabled {
        let _ = res.send_text(format!("Cannot {} {}", method, path));
        return res;
    }

    let (bg, fg, accent) = theme_colors(&config.theme);
    let safe_path = escape_html(path);
    let mut links = String::from(r#"<a href="javascript:history.back()">Go back</a>"#);
    if let Some(redirect) = &config.redirect_to {
        links.push_str(&format!(
            r#" · <a href="{}">Home</a>"#,
            escape_html(redirect)
        ));
    }
    if let Some(contact) = &config.contact {
        links.push_str(&format!(
            r#" · <a href="mailto:{}">Contact</a>"#,
            escape_html(contact)
        ));
    }

    let page = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
  body {{ background: {bg}; color: {fg}; font-family: system-ui, sans-serif;
         display: flex; align-items: center; justify-content: center;
         min-height: 100vh; margin: 0; }}
  main {{ text-align: center; padding: 2rem; }}
  h1 {{ font-size: 5rem; margin: 0; color: {accent}; }}
  code {{ background: rgba(128,128,128,.15); padding: .2rem .5rem;
          border-radius: 4px; }}
  a {{ color: {accent}; }}
</style>
</head>
<body>
<main>
  <h1>404</h1>
  <h2>{title}</h2>
  <p>{message}</p>
  <p>Requested path: <code>{path}</code></p>
  <p>{links}</p>
</main>
</body>
</html>"#,
        title = escape_html(&config.title),
        message = escape_html(&config.message),
        path = safe_path,
        bg = bg,
        fg = fg,
        accent = accent,
        links = links,
    );
    let _ = res.send_html(page);
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_mode_renders_html_with_code_and_path() {
        let config = NotFoundSection::default();
        let res = render_not_found(&config, Method::Get, "/missing/page");
        assert_eq!(res.status(), 404);
        assert_eq!(res.header("content-type"), Some("text/html; charset=utf-8"));
        let body = String::from_utf8(res.body().unwrap().to_vec()).unwrap();
        assert!(body.contains("<h1>404</h1>"));
        assert!(body.contains("/missing/page"));
    }

    #[test]
    fn disabled_mode_is_plain_text() {
        let mut config = NotFoundSection::default();
        config.enabled = false;
        let res = render_not_found(&config, Method::Post, "/nope");
        assert_eq!(res.status(), 404);
        let body = String::from_utf8(res.body().unwrap().to_vec()).unwrap();
        assert_eq!(body, "Cannot POST /nope");
    }

    #[test]
    fn optional_links_appear_when_configured() {
        let mut config = NotFoundSection::default();
        config.redirect_to = Some("/home".to_string());
        config.contact = Some("ops@example.com".to_string());
        let res = render_not_found(&config, Method::Get, "/x");
        let body = String::from_utf8(res.body().unwrap().to_vec()).unwrap();
        assert!(body.contains(r#"href="/home""#));
        assert!(body.contains("mailto:ops@example.com"));
    }

    #[test]
    fn path_is_html_escaped() {
        let config = NotFoundSection::default();
        let res = render_not_found(&config, Method::Get, "/<script>alert(1)</script>");
        let body = String::from_utf8(res.body().unwrap().to_vec()).unwrap();
        assert!(!body.contains("<script>alert"));
        assert!(body.contains("&lt;script&gt;"));
    }
}

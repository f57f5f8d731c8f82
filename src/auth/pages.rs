//! HTML for the authorization endpoint.

const LOGIN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Sign In - Things Cloud MCP</title>
<style>
body{margin:0;font-family:-apple-system,BlinkMacSystemFont,"Segoe UI",sans-serif;background:#F5F5F7;color:#1D1D1F}
.auth-container{min-height:100vh;display:flex;align-items:center;justify-content:center;padding:24px}
.auth-card{width:100%;max-width:380px;background:#fff;border:1px solid #E5E5EA;border-radius:12px;padding:40px 32px;box-shadow:0 2px 12px rgba(0,0,0,0.06)}
.auth-title{font-size:20px;font-weight:700;text-align:center;margin-bottom:6px}
.auth-subtitle{font-size:14px;color:#6E6E73;text-align:center;margin-bottom:28px}
.auth-error{background:#FFF2F2;color:#D70015;border:1px solid #FFD6D6;border-radius:8px;padding:10px 14px;font-size:13px;margin-bottom:20px}
.auth-field{margin-bottom:16px}
.auth-field label{display:block;font-size:13px;font-weight:600;margin-bottom:6px}
.auth-field input{width:100%;padding:10px 14px;font-size:15px;border:1px solid #E5E5EA;border-radius:8px;box-sizing:border-box}
.auth-btn{width:100%;padding:12px;font-size:15px;font-weight:600;color:#fff;background:#1A7CF9;border:none;border-radius:8px;cursor:pointer;margin-top:8px}
</style>
</head>
<body>
<div class="auth-container">
  <div class="auth-card">
    <div class="auth-title">Sign in with Things Cloud</div>
    <div class="auth-subtitle">{{subtitle}}</div>
    {{error}}
    <form method="POST" action="/authorize?{{query}}">
      <div class="auth-field">
        <label for="email">Email</label>
        <input type="email" id="email" name="email" required autocomplete="email" autofocus>
      </div>
      <div class="auth-field">
        <label for="password">Password</label>
        <input type="password" id="password" name="password" required autocomplete="current-password">
      </div>
      <button type="submit" class="auth-btn">Authorize</button>
    </form>
  </div>
</div>
</body>
</html>
"#;

/// Escapes text for HTML element content and quoted attribute values.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Renders the login form. `query` is the original `/authorize` query
/// string, carried into the form action so the POST sees the same request.
pub fn login_page(client_name: Option<&str>, error: Option<&str>, query: &str) -> String {
    let subtitle = match client_name {
        Some(name) if !name.is_empty() => {
            format!("<strong>{}</strong> wants to access your tasks", html_escape(name))
        }
        _ => "Authorize access to your tasks".to_string(),
    };
    let error = error
        .map(|msg| format!(r#"<div class="auth-error">{}</div>"#, html_escape(msg)))
        .unwrap_or_default();

    render(
        LOGIN_TEMPLATE,
        &[
            ("subtitle", subtitle.as_str()),
            ("error", error.as_str()),
            ("query", html_escape(query).as_str()),
        ],
    )
}

/// Fills `{{name}}` placeholders in a single pass, so substituted values are
/// never scanned for placeholders themselves. Unknown names are left as is.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        match vars.iter().find(|(name, _)| *name == &tail[..end]) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + end + 4]),
        }
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_in_client_name_is_not_expanded() {
        let page = login_page(Some("{{error}}"), Some("Unknown client_id."), "a=1");
        assert!(page.contains("<strong>{{error}}</strong>"));
        assert!(page.contains(r#"<div class="auth-error">Unknown client_id.</div>"#));
        assert!(page.contains("a=1"));
        assert!(!page.contains("{{query}}"));
        assert!(!page.contains("{{subtitle}}"));
    }

    #[test]
    fn test_render_single_pass() {
        assert_eq!(
            render("{{a}}-{{b}}-{{c}}", &[("a", "{{b}}"), ("b", "x")]),
            "{{b}}-x-{{c}}"
        );
        assert_eq!(render("open {{a", &[("a", "x")]), "open {{a");
    }

    #[test]
    fn test_escapes_client_name_and_query() {
        let page = login_page(
            Some("<script>alert(1)</script>"),
            None,
            "client_id=a&state=\"x\"",
        );
        assert!(!page.contains("<script>alert"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains(r#"action="/authorize?client_id=a&amp;state=&quot;x&quot;""#));
        assert!(!page.contains(r#"<div class="auth-error">"#));
    }

    #[test]
    fn test_renders_error() {
        let page = login_page(None, Some("Unknown client_id."), "");
        assert!(page.contains(r#"<div class="auth-error">Unknown client_id.</div>"#));
        assert!(page.contains("Authorize access to your tasks"));
    }
}

//! Page scripts evaluated during login
//!
//! Every value spliced into a script goes through `serde_json` so quotes and
//! backslashes in tokens or selectors cannot break out of the literal.

use crate::utils::constants::RECAPTCHA_RESPONSE_FIELD;

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Write a solved token into the response field and fire the widget callback.
/// Evaluates to `"callback_called"` or `"token_injected"`.
pub fn inject_token(token: &str) -> String {
    let token = js_string(token);
    let field = js_string(RECAPTCHA_RESPONSE_FIELD);
    format!(
        r#"(function() {{
    var token = {token};
    var el = document.getElementById({field});
    if (!el) {{
        el = document.createElement('textarea');
        el.id = {field};
        el.name = {field};
        el.style.display = 'none';
        document.body.appendChild(el);
    }}
    el.value = token;
    el.innerHTML = token;
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    try {{
        if (typeof ___grecaptcha_cfg !== 'undefined') {{
            var clients = ___grecaptcha_cfg.clients || {{}};
            for (var id in clients) {{
                var client = clients[id];
                for (var key in client) {{
                    var entry = client[key];
                    if (entry && typeof entry.callback === 'function') {{
                        entry.callback(token);
                        return 'callback_called';
                    }}
                }}
            }}
        }}
    }} catch (e) {{}}
    return 'token_injected';
}})()"#
    )
}

/// `true` once someone has completed the widget by hand
pub fn challenge_resolved() -> String {
    let field = js_string(RECAPTCHA_RESPONSE_FIELD);
    format!(
        r#"(function() {{
    var el = document.getElementById({field}) || document.querySelector('[name=' + JSON.stringify({field}) + ']');
    return !!(el && el.value && el.value.length > 0);
}})()"#
    )
}

/// `true`/`false` for a checkbox's state, `null` when it is absent
pub fn checkbox_state(selector: &str) -> String {
    let selector = js_string(selector);
    format!(
        r#"(function() {{
    var el = document.querySelector({selector});
    return el ? !!el.checked : null;
}})()"#
    )
}

pub fn element_exists(selector: &str) -> String {
    let selector = js_string(selector);
    format!("document.querySelector({selector}) !== null")
}

/// The widget's site key, or `null`
pub fn site_key() -> &'static str {
    r#"(function() {
    var el = document.querySelector('[data-sitekey]');
    return el ? el.getAttribute('data-sitekey') : null;
})()"#
}

pub fn page_title() -> &'static str {
    "document.title"
}

//! Message composition: `{field}` template substitution and deterministic
//! template rotation. Rendering is total; unresolved tokens stay literal so a
//! missing variable degrades personalization instead of aborting a send.

use std::collections::HashMap;

/// Render a template against a variable map. `{field}` tokens are replaced
/// with `variables[field]`; unknown tokens and unclosed braces are emitted
/// verbatim.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                match variables.get(token) {
                    Some(value) => output.push_str(value),
                    None => {
                        output.push('{');
                        output.push_str(token);
                        output.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                output.push('{');
                rest = after_open;
            }
        }
    }
    output.push_str(rest);
    output
}

/// Deterministic rotation index for a recipient: the same recipient always
/// gets the same template, so re-renders on retry stay consistent. md5 keeps
/// the index stable across processes, unlike the std hasher.
pub fn rotation_index(recipient_key: &str, template_count: usize) -> usize {
    if template_count <= 1 {
        return 0;
    }
    let digest = md5::compute(recipient_key.as_bytes());
    let mut value: u64 = 0;
    for byte in &digest.0[..8] {
        value = (value << 8) | u64::from(*byte);
    }
    (value % template_count as u64) as usize
}

/// Pick the rotation template for a recipient. `None` only when the campaign
/// has no templates at all (rejected earlier by campaign validation).
pub fn pick_template<'a>(templates: &'a [String], recipient_key: &str) -> Option<&'a str> {
    if templates.is_empty() {
        return None;
    }
    let index = rotation_index(recipient_key, templates.len());
    templates.get(index).map(String::as_str)
}

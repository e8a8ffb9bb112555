//! Script lookup and `{{name}}` template rendering (§4.2 stage 4, §9
//! "simple string-substitution contract... no conditionals or loops
//! assumed"). Grounded in `business/script_management.py`'s
//! `find_script_by_event_and_image_id`.

use std::collections::HashMap;

use runnerctl_domain::{ImageId, Script, ScriptEvent};

/// Picks the image-specific script for `event` if one exists, else the
/// image-independent default (`image_id: None`). Returns `None` if neither
/// is configured — callers treat a missing `on_startup`/`on_terminate` as a
/// no-op, but a missing `MetricsAgent` script is a config error the caller
/// should log loudly (it's documented as mandatory).
pub fn find_script<'a>(
    scripts: &'a [Script],
    event: ScriptEvent,
    image_id: &ImageId,
) -> Option<&'a Script> {
    scripts
        .iter()
        .find(|s| s.event == event && s.image_id.as_ref() == Some(image_id))
        .or_else(|| scripts.iter().find(|s| s.event == event && s.image_id.is_none()))
}

/// Renders `{{name}}` placeholders against `context`, leaving unmatched
/// placeholders untouched. No escaping, no nesting, no conditionals — the
/// original's template contract is exactly this simple.
pub fn render(template: &str, context: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let name = after_open[..end].trim();
                match context.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after_open[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let mut ctx = HashMap::new();
        ctx.insert("name".to_string(), "world".to_string());
        assert_eq!(render("echo hi {{name}}", &ctx), "echo hi world");
    }

    #[test]
    fn leaves_unknown_placeholders_untouched() {
        let ctx = HashMap::new();
        assert_eq!(render("echo {{missing}}", &ctx), "echo {{missing}}");
    }

    #[test]
    fn image_specific_script_wins_over_default() {
        let image_id = ImageId::new("img-1");
        let scripts = vec![
            Script {
                id: uuid::Uuid::new_v4(),
                image_id: None,
                event: ScriptEvent::OnStartup,
                template_body: "default".into(),
            },
            Script {
                id: uuid::Uuid::new_v4(),
                image_id: Some(image_id.clone()),
                event: ScriptEvent::OnStartup,
                template_body: "specific".into(),
            },
        ];
        let found = find_script(&scripts, ScriptEvent::OnStartup, &image_id).unwrap();
        assert_eq!(found.template_body, "specific");
    }
}

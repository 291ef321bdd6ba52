//! Prompts for vision-model field extraction.
//!
//! The prompt is generated from the [`FieldSchema`], so a custom document
//! type gets a matching prompt with no extra code. Layout hints, when
//! present, are appended as percentage positions.

use crate::pipeline::layout::{LayoutHint, LayoutRegion};
use crate::schema::FieldSchema;
use std::fmt::Write as _;

/// Fixed rules appended after the field list.
pub const EXTRACTION_RULES: &str = r#"Rules:
- Reply with ONE JSON object and nothing else. No markdown fences, no commentary.
- Use exactly the keys listed above.
- Copy values exactly as printed; do not translate or reformat identifiers.
- Use "" when a field is not visible or you are unsure.
- Numbers: digits only, no currency symbols or units."#;

/// Build the full extraction prompt for one page.
pub fn extraction_prompt(schema: &FieldSchema, hints: &LayoutHint) -> String {
    let mut p = String::new();
    let _ = writeln!(
        p,
        "You are reading {}. Extract the following fields:",
        schema.description
    );
    for f in &schema.fields {
        let marker = if f.required { " (required)" } else { "" };
        let _ = writeln!(p, "- \"{}\": {}{}", f.name, f.description, marker);
    }

    p.push_str("\nReturn JSON in exactly this shape:\n");
    p.push_str(&json_template(schema));
    p.push_str("\n\n");
    p.push_str(EXTRACTION_RULES);

    let hint_text = layout_hint_text(hints);
    if !hint_text.is_empty() {
        p.push_str("\n\n");
        p.push_str(&hint_text);
    }
    p
}

/// `{"name": "<example>", ...}` in schema order.
fn json_template(schema: &FieldSchema) -> String {
    let body: Vec<String> = schema
        .fields
        .iter()
        .map(|f| {
            let example = f.example.as_deref().unwrap_or("");
            format!(
                "  {}: {}",
                serde_json::Value::String(f.name.clone()),
                serde_json::Value::String(example.to_string())
            )
        })
        .collect();
    format!("{{\n{}\n}}", body.join(",\n"))
}

fn describe(r: &LayoutRegion, hints: &LayoutHint) -> String {
    let pct = |v: u32, total: u32| {
        if total == 0 {
            0
        } else {
            (v as f64 * 100.0 / total as f64).round() as u32
        }
    };
    format!(
        "x {}–{}%, y {}–{}%",
        pct(r.x, hints.image_width),
        pct(r.x + r.w, hints.image_width),
        pct(r.y, hints.image_height),
        pct(r.y + r.h, hints.image_height)
    )
}

/// Layout hint sentences; empty when there are no regions.
pub fn layout_hint_text(hints: &LayoutHint) -> String {
    if hints.is_empty() {
        return String::new();
    }
    let mut lines = vec!["Layout hints (positions as % of page width/height):".to_string()];
    if let Some(tb) = hints.title_block() {
        let qualifier = if tb.estimated { " (estimated)" } else { "" };
        lines.push(format!(
            "- The title block{} is at {}. Drawing number, part name, material and scale are usually there.",
            qualifier,
            describe(tb, hints)
        ));
    }
    let areas: Vec<String> = hints.dimension_areas().map(|r| describe(r, hints)).collect();
    if !areas.is_empty() {
        lines.push(format!(
            "- Dimension annotations (Φ diameters, lengths, tolerances) appear near: {}.",
            areas.join("; ")
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::layout::RegionKind;

    #[test]
    fn prompt_lists_every_field() {
        let schema = FieldSchema::invoice();
        let p = extraction_prompt(&schema, &LayoutHint::empty(100, 100));
        for name in schema.field_names() {
            assert!(p.contains(&format!("\"{name}\"")), "missing {name}");
        }
        assert!(p.contains("(required)"));
        assert!(p.contains("Use \"\""));
        assert!(!p.contains("Layout hints"));
    }

    #[test]
    fn template_is_valid_json() {
        let t = json_template(&FieldSchema::drawing());
        let v: serde_json::Value = serde_json::from_str(&t).unwrap();
        assert_eq!(v["drawing_number"], "GB-2024-0153");
        assert_eq!(v["surface_treatment"], "");
    }

    #[test]
    fn hints_render_as_percentages() {
        let hints = LayoutHint {
            image_width: 1000,
            image_height: 500,
            regions: vec![
                LayoutRegion {
                    kind: RegionKind::TitleBlock,
                    x: 700,
                    y: 400,
                    w: 300,
                    h: 100,
                    estimated: true,
                },
                LayoutRegion {
                    kind: RegionKind::DimensionArea,
                    x: 100,
                    y: 50,
                    w: 400,
                    h: 50,
                    estimated: false,
                },
            ],
        };
        let text = layout_hint_text(&hints);
        assert!(text.contains("title block (estimated) is at x 70–100%, y 80–100%"), "{text}");
        assert!(text.contains("x 10–50%, y 10–20%"), "{text}");

        let p = extraction_prompt(&FieldSchema::drawing(), &hints);
        assert!(p.ends_with(&text));
    }
}

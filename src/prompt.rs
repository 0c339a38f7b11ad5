//! Plantilla del prompt de selección de etiquetas.

use crate::models::TAG_UNKNOWN;

pub const TAG_OPEN: &str = "<tag>";
pub const TAG_CLOSE: &str = "</tag>";

/// Una sola pasada de `format!`: el texto insertado nunca se vuelve a interpretar.
fn render_tag_prompt(tags: &str, title: &str, feedback: &str) -> String {
    format!(
        r#"You are tasked with selecting appropriate tags from the given list based on user feedback enclosed within the `<feedback>` XML tag.

        Here is the list of potential tags:
        <tags>
        {tags}
        </tags>

        <title>
        {title}
        </title>

        <feedback>
        {feedback}
        </feedback>

        Please choose up to three tags from the tag list and respond with them as a comma-separated list within <tag></tag> tags. If none of the tags above are suitable for the feedback or information is not enough, respond with <tag>{unknown}</tag>. No explanation is required. No need to echo the tag list or the feedback.
        "#,
        unknown = TAG_UNKNOWN,
    )
}

/// Construye el prompt con el título, el cuerpo y una línea con viñeta por categoría.
pub fn build_tag_prompt(title: &str, feedback: &str, categories: &[String]) -> String {
    let tags = categories
        .iter()
        .map(|c| format!("\t\t- {c}"))
        .collect::<Vec<_>>()
        .join("\n");

    render_tag_prompt(tags.trim(), title, feedback)
}

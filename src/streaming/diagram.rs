use anyhow::Result;

/// Turns the source of an `ageaf-diagram` fence into text for the transcript.
pub trait DiagramRenderer: Send + Sync {
    fn render(&self, source: &str) -> Result<String>;
}

/// Re-emits the diagram source as a `mermaid` block the page renders itself.
pub struct MermaidFenceRenderer;

impl DiagramRenderer for MermaidFenceRenderer {
    fn render(&self, source: &str) -> Result<String> {
        let source = source.trim_end_matches(['\r', '\n']);
        Ok(format!("```mermaid\n{source}\n```\n"))
    }
}

/// Renders a diagram body, substituting a placeholder when the body is too
/// large or the renderer fails.
pub fn render_diagram(renderer: &dyn DiagramRenderer, source: &str, max_chars: usize) -> String {
    let chars = source.chars().count();
    if chars > max_chars {
        tracing::warn!("Diagram of {chars} characters exceeds limit of {max_chars}");
        return format!("\n_[Diagram omitted: {chars} characters exceeds the limit of {max_chars}]_\n");
    }
    match renderer.render(source) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!("Failed to render diagram: {e}");
            "\n_[Diagram could not be rendered]_\n".to_string()
        }
    }
}

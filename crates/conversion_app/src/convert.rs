use conversion_core::TransformMode;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("conversion failed: document is empty")]
    EmptyDocument,
    #[error("conversion failed: no text content in minimal mode")]
    NoText,
}

pub trait Converter: Send + Sync {
    fn to_markdown(&self, html: &str, mode: TransformMode) -> Result<String, ConvertError>;
}

/// `Full` renders through html2md; `Minimal` keeps only the text.
#[derive(Debug, Default, Clone, Copy)]
pub struct Html2MdConverter;

impl Converter for Html2MdConverter {
    fn to_markdown(&self, html: &str, mode: TransformMode) -> Result<String, ConvertError> {
        if html.trim().is_empty() {
            return Err(ConvertError::EmptyDocument);
        }
        match mode {
            TransformMode::Full => Ok(html2md::parse_html(html)),
            TransformMode::Minimal => {
                let text = strip_tags(html);
                if text.is_empty() {
                    Err(ConvertError::NoText)
                } else {
                    Ok(text)
                }
            }
        }
    }
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

use crate::error::IngestError;
use lopdf::Document;
use std::path::{Path, PathBuf};

/// Text of every page that has any, in page order.
pub fn extract_page_texts(path: &Path) -> Result<Vec<String>, IngestError> {
    let document =
        Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;

        if !text.is_empty() {
            pages.push(text);
        }
    }

    Ok(pages)
}

/// Full document text: every non-empty page followed by a newline.
pub fn join_pages(pages: &[String]) -> String {
    let mut full_text = String::new();
    for page in pages.iter().filter(|page| !page.is_empty()) {
        full_text.push_str(page);
        full_text.push('\n');
    }
    full_text
}

/// Extracts the text of a PDF on a blocking worker thread.
pub async fn extract_text(path: &Path) -> Result<String, IngestError> {
    let path: PathBuf = path.to_path_buf();
    let pages = tokio::task::spawn_blocking(move || extract_page_texts(&path)).await??;
    Ok(join_pages(&pages))
}

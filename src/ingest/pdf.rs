use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;

use crate::error::IngestError;
use crate::models::{Document, DocumentMetadata, Page};

/// Reads page text and document info from a PDF.
///
/// Prefers poppler's `pdfinfo`/`pdftotext`, which keep page boundaries and
/// report the info dictionary; falls back to `pdf-extract` when the tools are
/// missing or produce no text. Pages with blank text are dropped but the
/// remaining pages keep their original 0-based index.
pub async fn extract_document(pdf_path: &Path) -> Result<Document> {
    if !tokio::fs::metadata(pdf_path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
    {
        return Err(IngestError::FileNotFound(pdf_path.to_path_buf()).into());
    }

    let mut metadata = DocumentMetadata::default();
    let mut pages = Vec::new();

    if has_command("pdfinfo").await && has_command("pdftotext").await {
        match read_pdf_info(pdf_path).await {
            Ok(info) => {
                metadata = metadata_from_info(&info);
                let page_count = info
                    .get("Pages")
                    .and_then(|value| value.parse::<usize>().ok())
                    .unwrap_or(0);
                pages = extract_pages_with_pdftotext(pdf_path, page_count).await?;
            }
            Err(err) => tracing::warn!("pdfinfo failed for {}: {err:#}", pdf_path.display()),
        }
    }

    if pages.is_empty() {
        tracing::info!(
            "falling back to pdf-extract for {}",
            pdf_path.display()
        );
        let path = pdf_path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
            .await
            .context("PDF extraction task panicked")?
            .map_err(|err| IngestError::Extraction(err.to_string()))?;

        pages = split_form_feed_pages(&extracted);
    }

    if pages.is_empty() {
        return Err(IngestError::Extraction(format!(
            "no readable text in {}",
            pdf_path.display()
        ))
        .into());
    }

    tracing::info!(
        pages = pages.len(),
        title = %metadata.title,
        "extracted {}",
        pdf_path.display()
    );

    Ok(Document { metadata, pages })
}

async fn extract_pages_with_pdftotext(pdf_path: &Path, page_count: usize) -> Result<Vec<Page>> {
    let mut pages = Vec::new();

    for page in 1..=page_count {
        let output = Command::new("pdftotext")
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-nopgbrk")
            .arg("-enc")
            .arg("UTF-8")
            .arg(pdf_path)
            .arg("-")
            .output()
            .await
            .with_context(|| format!("failed to run pdftotext for page {}", page))?;

        if !output.status.success() {
            tracing::warn!("pdftotext exited with {} on page {}", output.status, page);
            continue;
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        if text.trim().is_empty() {
            continue;
        }

        pages.push(Page {
            index: page - 1,
            text,
        });
    }

    Ok(pages)
}

async fn read_pdf_info(pdf_path: &Path) -> Result<HashMap<String, String>> {
    let output = Command::new("pdfinfo")
        .arg("-enc")
        .arg("UTF-8")
        .arg(pdf_path)
        .output()
        .await
        .context("failed to run pdfinfo")?;

    if !output.status.success() {
        anyhow::bail!("pdfinfo exited with non-zero status");
    }

    parse_pdf_info(&String::from_utf8_lossy(&output.stdout))
}

fn parse_pdf_info(stdout: &str) -> Result<HashMap<String, String>> {
    let regex = Regex::new(r"(?m)^([A-Za-z][A-Za-z ]*):[ \t]*(.*?)[ \t\r]*$")?;
    Ok(regex
        .captures_iter(stdout)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect())
}

fn metadata_from_info(info: &HashMap<String, String>) -> DocumentMetadata {
    let field = |key: &str| info.get(key).cloned().unwrap_or_default();
    DocumentMetadata {
        title: field("Title"),
        author: field("Author"),
        creation_date: field("CreationDate"),
    }
}

fn split_form_feed_pages(extracted: &str) -> Vec<Page> {
    extracted
        .split('\u{000c}')
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(index, text)| Page {
            index,
            text: text.to_string(),
        })
        .collect()
}

async fn has_command(binary: &str) -> bool {
    Command::new("which")
        .arg(binary)
        .output()
        .await
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_info_fields_become_metadata() {
        let stdout = "Title:          Nifty Bridge Terms of Service\n\
                      Author:         Legal Team \n\
                      CreationDate:   Tue Mar 14 10:00:00 2023 UTC\n\
                      Pages:          12\n";
        let info = parse_pdf_info(stdout).unwrap();
        let metadata = metadata_from_info(&info);

        assert_eq!(metadata.title, "Nifty Bridge Terms of Service");
        assert_eq!(metadata.author, "Legal Team");
        assert_eq!(metadata.creation_date, "Tue Mar 14 10:00:00 2023 UTC");
        assert_eq!(info.get("Pages").map(String::as_str), Some("12"));
    }

    #[test]
    fn missing_info_fields_are_empty() {
        let info = parse_pdf_info("Pages: 3\n").unwrap();
        assert_eq!(metadata_from_info(&info), DocumentMetadata::default());
    }

    #[test]
    fn form_feeds_split_pages_and_keep_indices() {
        let pages = split_form_feed_pages("first page\u{000c}  \u{000c}third page");
        assert_eq!(
            pages,
            vec![
                Page {
                    index: 0,
                    text: "first page".to_string(),
                },
                Page {
                    index: 2,
                    text: "third page".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = extract_document(Path::new("/definitely/not/here.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::FileNotFound(_))
        ));
    }
}

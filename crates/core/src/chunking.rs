use crate::error::IngestError;
use crate::models::ChunkingConfig;

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Splits extracted document text into overlapping chunks that prefer to end on a
/// sentence or line boundary.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Result<Vec<String>, IngestError> {
    config.validate()?;

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let chunks = window_spans(&chars, config)
        .into_iter()
        .filter_map(|(start, end)| {
            let piece: String = chars[start..end].iter().collect();
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect();

    Ok(chunks)
}

fn window_spans(chars: &[char], config: ChunkingConfig) -> Vec<(usize, usize)> {
    let total = chars.len();
    let mut spans = Vec::new();
    let mut start = 0;

    while start < total {
        let mut end = (start + config.chunk_size).min(total);

        if end < total {
            let boundary = chars[start..end]
                .iter()
                .rposition(|c| *c == '.' || *c == '\n');

            if let Some(position) = boundary {
                if position > config.chunk_size / 2 {
                    end = start + position + 1;
                }
            }
        }

        spans.push((start, end));

        if end >= total {
            break;
        }

        start = end.saturating_sub(config.chunk_overlap).max(start + 1);
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
        }
    }

    #[test]
    fn empty_and_whitespace_text_yield_no_chunks() {
        assert!(chunk_text("", ChunkingConfig::default()).unwrap().is_empty());
        assert!(chunk_text(" \n\t \n", ChunkingConfig::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn short_text_is_a_single_trimmed_chunk() {
        let chunks =
            chunk_text("  Refunds are issued within 30 days.  \n", config(100, 20)).unwrap();
        assert_eq!(chunks, vec!["Refunds are issued within 30 days.".to_string()]);
    }

    #[test]
    fn window_ends_on_sentence_boundary_past_midpoint() {
        let text = "aaaaaaaaaaaaaaa. bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let chunks = chunk_text(text, config(20, 5)).unwrap();

        assert_eq!(chunks[0], "aaaaaaaaaaaaaaa.");
    }

    #[test]
    fn boundary_before_midpoint_is_ignored() {
        let text = "aaa. bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let chunks = chunk_text(text, config(20, 5)).unwrap();

        assert_eq!(chunks[0].chars().count(), 20);
        assert_eq!(chunks[0], "aaa. bbbbbbbbbbbbbbb");
    }

    #[test]
    fn consecutive_chunks_share_the_overlap() {
        let text: String = ('a'..='z').cycle().take(50).collect();
        let chunks = chunk_text(&text, config(20, 5)).unwrap();

        assert_eq!(chunks.len(), 3);
        let first_tail: String = chunks[0].chars().skip(15).collect();
        let second_head: String = chunks[1].chars().take(5).collect();
        assert_eq!(first_tail, second_head);
    }

    #[test]
    fn overlap_is_measured_from_truncated_end() {
        let text = "0123456789012.4567890123456789";
        let chars: Vec<char> = text.chars().collect();
        let spans = window_spans(&chars, config(20, 4));

        assert_eq!(spans[0], (0, 14));
        assert_eq!(spans[1].0, 10);
    }

    #[test]
    fn windows_cover_every_character() {
        let text = "First sentence here. Second one follows.\nA new line starts.\n\n\
                    Then a much longer paragraph without any stops at all for quite a while \
                    until eventually it ends. Short. Tail";
        let chars: Vec<char> = text.chars().collect();

        for (size, overlap) in [(10, 0), (16, 3), (25, 12), (40, 39), (1_000, 200)] {
            let spans = window_spans(&chars, config(size, overlap));
            let mut covered = vec![false; chars.len()];
            for (start, end) in &spans {
                assert!(start < end);
                for flag in &mut covered[*start..*end] {
                    *flag = true;
                }
            }
            assert!(covered.iter().all(|flag| *flag), "gap for size={size} overlap={overlap}");

            for chunk in chunk_text(text, config(size, overlap)).unwrap() {
                assert!(!chunk.trim().is_empty());
            }
        }
    }

    #[test]
    fn multibyte_text_is_split_on_characters() {
        let text = "ééééééééééééééééééééééééééééé";
        let chunks = chunk_text(text, config(10, 2)).unwrap();
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
    }

    #[test]
    fn overlap_not_smaller_than_size_is_rejected() {
        assert!(matches!(
            chunk_text("text", config(10, 10)),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(chunk_text("text", config(0, 0)).is_err());
    }
}

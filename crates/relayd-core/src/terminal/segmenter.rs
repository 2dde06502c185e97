//! Message segmenter
//!
//! Splits text into chunks no longer than a chat transport's message limit.
//! Lengths are counted in characters. Chunks break after a newline whenever
//! possible; a single line longer than the limit is force-split, preferring
//! the last whitespace in the second half of the window. Concatenating the
//! chunks always reproduces the input exactly.

/// Split `text` into ordered chunks of at most `limit` characters.
///
/// Empty input yields no chunks; input within the limit yields one.
pub fn segment(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line_len <= limit {
            current.push_str(line);
            current_len = line_len;
            continue;
        }

        let mut rest = line;
        while rest.chars().count() > limit {
            let cut = force_split_at(rest, limit);
            let (head, tail) = rest.split_at(cut);
            chunks.push(head.to_string());
            rest = tail;
        }
        current.push_str(rest);
        current_len = rest.chars().count();
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Byte offset to cut an over-long line so the head holds at most `limit` chars
fn force_split_at(line: &str, limit: usize) -> usize {
    let hard = line
        .char_indices()
        .nth(limit)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len());
    let window = &line[..hard];
    let min_soft = line
        .char_indices()
        .nth(limit / 2)
        .map(|(idx, _)| idx)
        .unwrap_or(0);

    match window.rfind(char::is_whitespace) {
        Some(pos) if pos >= min_soft => {
            // Cut after the whitespace so it stays with the head
            pos + window[pos..].chars().next().map_or(1, char::len_utf8)
        }
        _ => hard,
    }
}

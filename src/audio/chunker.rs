//! Splits a finalized audio buffer into fixed-size chunks for streaming.

/// One slice of the input audio. Only the final chunk has `is_last` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioChunk<'a> {
    pub data: &'a [u8],
    pub is_last: bool,
}

/// Split `audio` into consecutive chunks of `chunk_size` bytes; the final chunk
/// may be shorter. Empty input yields no chunks. A `chunk_size` of zero sends the
/// whole buffer as a single chunk.
pub fn split(audio: &[u8], chunk_size: usize) -> Vec<AudioChunk<'_>> {
    if audio.is_empty() {
        return Vec::new();
    }

    let size = if chunk_size == 0 { audio.len() } else { chunk_size };
    let count = (audio.len() + size - 1) / size;

    audio
        .chunks(size)
        .enumerate()
        .map(|(index, data)| AudioChunk {
            data,
            is_last: index + 1 == count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenation_reconstructs_input() {
        let audio: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = split(&audio, 3200);

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].data.len(), 10_000 - 3 * 3200);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        assert_eq!(joined, audio);
    }

    #[test]
    fn test_only_final_chunk_is_last() {
        let audio = vec![0u8; 6400];
        let chunks = split(&audio, 3200);

        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_last);
        assert!(chunks[1].is_last);
    }

    #[test]
    fn test_empty_and_short_inputs() {
        assert!(split(&[], 3200).is_empty());

        let single = split(&[1, 2, 3], 3200);
        assert_eq!(single.len(), 1);
        assert!(single[0].is_last);

        let whole = split(&[1, 2, 3], 0);
        assert_eq!(whole, vec![AudioChunk { data: &[1, 2, 3], is_last: true }]);
    }
}

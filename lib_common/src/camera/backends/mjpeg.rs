//! Splits a concatenated MJPEG byte stream into individual JPEG images.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on buffered bytes without a complete frame.
const MAX_PENDING: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct MjpegSplitter {
    buf: Vec<u8>,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every JPEG completed by it, oldest first.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &SOI) else {
                // Keep a trailing 0xFF, it may be the first half of the next SOI.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let drop_to = self.buf.len() - keep;
                self.buf.drain(..drop_to);
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            let Some(end) = find(&self.buf[SOI.len()..], &EOI) else {
                if self.buf.len() > MAX_PENDING {
                    log::warn!("Discarding {} bytes of MJPEG without end marker", self.buf.len());
                    self.buf.clear();
                }
                break;
            };
            let frame_len = SOI.len() + end + EOI.len();
            frames.push(self.buf.drain(..frame_len).collect());
        }

        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[test]
    fn splits_frames_across_chunk_boundaries() {
        let a = jpeg(&[1, 2, 3]);
        let b = jpeg(&[4, 5]);
        let mut stream = vec![0x00, 0x11];
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut splitter = MjpegSplitter::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(3) {
            out.extend(splitter.push(chunk));
        }

        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn incomplete_frame_waits_for_more_data() {
        let mut splitter = MjpegSplitter::new();
        assert!(splitter.push(&[0xFF, 0xD8, 9, 9]).is_empty());
        assert_eq!(splitter.push(&[0xFF, 0xD9]), vec![vec![0xFF, 0xD8, 9, 9, 0xFF, 0xD9]]);
    }
}

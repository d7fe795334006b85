//! Signalling tones
//!
//! DTMF digits are rendered as audio so they survive any raw PCM transport.
//! The CTCSS mixer adds a continuous sub-audible tone under the voice.

use std::f32::consts::TAU;

/// Length of one DTMF digit
pub const DTMF_TONE_MS: usize = 100;

/// Silence after each DTMF digit
pub const DTMF_GAP_MS: usize = 50;

/// Peak level of each of the two DTMF tones
const DTMF_AMPLITUDE: f32 = 0.35 * i16::MAX as f32;

/// Level of the CTCSS tone relative to full scale
const CTCSS_LEVEL: f32 = 0.1;

const DTMF_ROWS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
const DTMF_COLS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];
const DTMF_KEYPAD: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];

/// Row and column frequency of a DTMF digit
pub fn dtmf_frequencies(digit: char) -> Option<(f32, f32)> {
    let digit = digit.to_ascii_uppercase();
    DTMF_KEYPAD.iter().enumerate().find_map(|(row, keys)| {
        keys.iter()
            .position(|&k| k == digit)
            .map(|col| (DTMF_ROWS[row], DTMF_COLS[col]))
    })
}

/// Render `digits` as mono DTMF audio; unknown characters are skipped
pub fn render_dtmf(digits: &str, sample_rate: u32) -> Vec<i16> {
    let tone_len = sample_rate as usize * DTMF_TONE_MS / 1000;
    let gap_len = sample_rate as usize * DTMF_GAP_MS / 1000;
    let mut out = Vec::with_capacity(digits.len() * (tone_len + gap_len));

    for digit in digits.chars() {
        let Some((low, high)) = dtmf_frequencies(digit) else {
            tracing::warn!("Ignoring invalid DTMF digit {:?}", digit);
            continue;
        };
        let sr = sample_rate as f32;
        out.extend((0..tone_len).map(|n| {
            let t = n as f32 / sr;
            let v = (TAU * low * t).sin() + (TAU * high * t).sin();
            (v * DTMF_AMPLITUDE) as i16
        }));
        out.resize(out.len() + gap_len, 0);
    }
    out
}

/// Continuous sub-audible tone mixed into outgoing audio
#[derive(Debug, Clone)]
pub struct CtcssMixer {
    phase_step: f32,
    phase: f32,
}

impl CtcssMixer {
    pub fn new(freq: f32, sample_rate: u32) -> Self {
        Self {
            phase_step: TAU * freq / sample_rate as f32,
            phase: 0.0,
        }
    }

    /// Add the tone to interleaved `samples`, same value on every channel
    pub fn mix(&mut self, samples: &mut [i16], channels: usize) {
        let amplitude = CTCSS_LEVEL * i16::MAX as f32;
        for frame in samples.chunks_mut(channels.max(1)) {
            let tone = (self.phase.sin() * amplitude) as i16;
            for s in frame {
                *s = s.saturating_add(tone);
            }
            self.phase = (self.phase + self.phase_step) % TAU;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Power of `freq` in `samples` (Goertzel)
    fn goertzel(samples: &[i16], freq: f32, sample_rate: u32) -> f32 {
        let coeff = 2.0 * (TAU * freq / sample_rate as f32).cos();
        let (mut s1, mut s2) = (0.0f32, 0.0f32);
        for &x in samples {
            let s0 = x as f32 + coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        s1 * s1 + s2 * s2 - coeff * s1 * s2
    }

    #[test]
    fn test_dtmf_frequencies() {
        assert_eq!(dtmf_frequencies('1'), Some((697.0, 1209.0)));
        assert_eq!(dtmf_frequencies('#'), Some((941.0, 1477.0)));
        assert_eq!(dtmf_frequencies('d'), Some((941.0, 1633.0)));
        assert_eq!(dtmf_frequencies('x'), None);
    }

    #[test]
    fn test_render_dtmf_length_and_content() {
        let audio = render_dtmf("5x", 8000);
        assert_eq!(audio.len(), 800 + 400);

        let tone = &audio[..800];
        let hit = goertzel(tone, 770.0, 8000) + goertzel(tone, 1336.0, 8000);
        let miss = goertzel(tone, 697.0, 8000) + goertzel(tone, 1477.0, 8000);
        assert!(hit > miss * 10.0);
        assert!(audio[800..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_ctcss_phase_is_continuous() {
        let mut whole = vec![0i16; 160];
        CtcssMixer::new(136.5, 8000).mix(&mut whole, 1);

        let mut split = vec![0i16; 160];
        let mut mixer = CtcssMixer::new(136.5, 8000);
        let (a, b) = split.split_at_mut(60);
        mixer.mix(a, 1);
        mixer.mix(b, 1);

        assert_eq!(whole, split);
        assert!(whole.iter().any(|&s| s != 0));
    }
}

//! G.711 µ-law codec (PCMU), the payload carried on the audio channel

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Compress one linear PCM sample, clipping at ±32635
pub fn encode_sample(pcm: i16) -> u8 {
    let mut sample = i32::from(pcm);
    let sign = if sample < 0 {
        sample = -sample;
        0x80
    } else {
        0
    };
    sample = sample.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && sample & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (sample >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn decode_sample(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

pub fn decode(payload: &[u8]) -> Vec<i16> {
    payload.iter().map(|&b| decode_sample(b)).collect()
}

use crate::codec::VideoCodec;

#[cfg(target_os = "linux")]
pub mod linux;

pub mod cpu;

/// Resolves the configured acceleration mode. Anything other than "auto"
/// is taken at face value.
pub fn detect(configured_mode: Option<&str>) -> String {
    let mode = configured_mode.unwrap_or("auto");
    if mode != "auto" {
        return mode.to_string();
    }

    #[cfg(target_os = "linux")]
    {
        return linux::detect_auto();
    }

    // VAAPI is the only accelerated path; everything else encodes on the CPU.
    #[allow(unreachable_code)]
    "cpu".to_string()
}

/// Video encoder arguments for one output.
pub fn get_ffmpeg_args(hw_accel: &str, codec: VideoCodec, threads: u8) -> Vec<String> {
    #[cfg(target_os = "linux")]
    if hw_accel == "vaapi" {
        return linux::get_args_vaapi(codec);
    }

    cpu::get_args(codec, threads)
}

/// Arguments that must precede `-i`.
pub fn get_global_args(hw_accel: &str) -> Vec<String> {
    #[cfg(target_os = "linux")]
    if hw_accel == "vaapi" {
        return linux::get_global_args_vaapi();
    }

    let _ = hw_accel;
    Vec::new()
}

/// Audio is always AC-3 regardless of acceleration.
pub fn get_audio_args(sample_rate: u32) -> Vec<String> {
    vec![
        "-c:a".into(), "ac3".into(),
        "-ar".into(), sample_rate.to_string(),
        "-ac".into(), "2".into(),
        "-b:a".into(), "192k".into(),
    ]
}

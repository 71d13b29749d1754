use crate::codec::VideoCodec;

pub fn get_args(codec: VideoCodec, threads: u8) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-vf".into(), "yadif".into(),
        "-pix_fmt".into(), "yuv420p".into(),
    ];

    match codec {
        VideoCodec::H264 => {
            args.extend([
                "-c:v".into(), "libx264".into(),
                "-preset".into(), "veryfast".into(),
                "-crf".into(), "21".into(),
                "-maxrate".into(), "8M".into(),
                "-bufsize".into(), "16M".into(),
                "-profile:v".into(), "main".into(),
            ]);
        }
        VideoCodec::Mpeg2 => {
            args.extend([
                "-c:v".into(), "mpeg2video".into(),
                "-q:v".into(), "4".into(),
                "-maxrate".into(), "10M".into(),
                "-bufsize".into(), "4M".into(),
            ]);
        }
    }

    // Keyframe every two seconds so joining viewers start quickly. No
    // B-frames: every consumer drops packets whose pts does not advance.
    args.extend([
        "-g".into(), "50".into(),
        "-bf".into(), "0".into(),
        "-threads".into(), threads.to_string(),
    ]);
    args
}

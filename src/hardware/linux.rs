use crate::codec::VideoCodec;
use std::path::Path;
use tracing::{info, warn};

const RENDER_NODE: &str = "/dev/dri/renderD128";

pub fn detect_auto() -> String {
    let path = Path::new(RENDER_NODE);
    if !path.exists() {
        info!("Auto-detection: no VAAPI device at {:?}, using 'cpu' mode.", path);
        return "cpu".to_string();
    }
    match std::fs::File::open(path) {
        Ok(_) => {
            info!("Auto-detected VAAPI device at {:?}. Using 'vaapi' mode.", path);
            "vaapi".to_string()
        }
        Err(e) => {
            warn!("VAAPI device at {:?} cannot be opened ({}), falling back to 'cpu'. Check render group membership.", path, e);
            "cpu".to_string()
        }
    }
}

pub fn get_global_args_vaapi() -> Vec<String> {
    vec![
        "-init_hw_device".into(), format!("vaapi=va:{RENDER_NODE}"),
        "-filter_hw_device".into(), "va".into(),
    ]
}

pub fn get_args_vaapi(codec: VideoCodec) -> Vec<String> {
    let encoder = match codec {
        VideoCodec::H264 => "h264_vaapi",
        VideoCodec::Mpeg2 => "mpeg2_vaapi",
    };
    vec![
        // Upload to the GPU and deinterlace there.
        "-vf".into(), "format=nv12,hwupload,deinterlace_vaapi".into(),
        "-c:v".into(), encoder.into(),
        "-b:v".into(), "6M".into(),
        "-maxrate".into(), "8M".into(),
        "-bufsize".into(), "8M".into(),
        "-g".into(), "50".into(),
        "-bf".into(), "0".into(),
    ]
}

//! Encoder preset and stream-target tables
//!
//! A preset is the entire user-facing encoding surface: it picks the codec,
//! the container suffix, and the option list handed to the encoder process.
//! Stream targets swap the file output for a network mux + address.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    H264Default,
    H264Nvidia,
    H264Lossless420,
    H264Lossless444,
    HevcDefault,
    HevcNvidia,
    ProRes422,
    ProRes4444,
    Vp8Default,
    Vp9Default,
    Hap,
    HapAlpha,
    HapQ,
}

impl Default for Preset {
    fn default() -> Self { Preset::H264Default }
}

impl Preset {
    pub fn display_name(self) -> &'static str {
        match self {
            Preset::H264Default => "H.264 Default (MP4)",
            Preset::H264Nvidia => "H.264 NVIDIA (MP4)",
            Preset::H264Lossless420 => "H.264 Lossless 420 (MP4)",
            Preset::H264Lossless444 => "H.264 Lossless 444 (MP4)",
            Preset::HevcDefault => "HEVC Default (MP4)",
            Preset::HevcNvidia => "HEVC NVIDIA (MP4)",
            Preset::ProRes422 => "ProRes 422 (QuickTime)",
            Preset::ProRes4444 => "ProRes 4444 (QuickTime)",
            Preset::Vp8Default => "VP8 (WebM)",
            Preset::Vp9Default => "VP9 (WebM)",
            Preset::Hap => "HAP (QuickTime)",
            Preset::HapAlpha => "HAP Alpha (QuickTime)",
            Preset::HapQ => "HAP Q (QuickTime)",
        }
    }

    /// Container suffix for file output, including the dot.
    pub fn suffix(self) -> &'static str {
        match self {
            Preset::H264Default
            | Preset::H264Nvidia
            | Preset::H264Lossless420
            | Preset::H264Lossless444
            | Preset::HevcDefault
            | Preset::HevcNvidia => ".mp4",
            Preset::ProRes422 | Preset::ProRes4444 => ".mov",
            Preset::Vp8Default | Preset::Vp9Default => ".webm",
            Preset::Hap | Preset::HapAlpha | Preset::HapQ => ".mov",
        }
    }

    /// Codec/quality options, already split into argv form.
    pub fn options(self) -> &'static [&'static str] {
        match self {
            Preset::H264Default => &["-pix_fmt", "yuv420p"],
            Preset::H264Nvidia => &["-c:v", "h264_nvenc", "-pix_fmt", "yuv420p"],
            Preset::H264Lossless420 => {
                &["-pix_fmt", "yuv420p", "-preset", "ultrafast", "-crf", "0"]
            }
            Preset::H264Lossless444 => {
                &["-pix_fmt", "yuv444p", "-preset", "ultrafast", "-crf", "0"]
            }
            Preset::HevcDefault => &["-c:v", "libx265", "-pix_fmt", "yuv420p"],
            Preset::HevcNvidia => &["-c:v", "hevc_nvenc", "-pix_fmt", "yuv420p"],
            Preset::ProRes422 => &["-c:v", "prores_ks", "-pix_fmt", "yuv422p10le"],
            Preset::ProRes4444 => &["-c:v", "prores_ks", "-pix_fmt", "yuva444p10le"],
            Preset::Vp8Default => &["-c:v", "libvpx", "-pix_fmt", "yuv420p"],
            Preset::Vp9Default => &["-c:v", "libvpx-vp9"],
            Preset::Hap => &["-c:v", "hap"],
            Preset::HapAlpha => &["-c:v", "hap", "-format", "hap_alpha"],
            Preset::HapQ => &["-c:v", "hap", "-format", "hap_q"],
        }
    }
}

/// Live-stream targets. The mux options replace the file container; the
/// stream address is appended as the last argument in place of a file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTarget {
    Udp,
    Rtp,
    Rtsp,
    Hls,
    HlsSegment,
    Rtmp,
}

impl StreamTarget {
    // NOTE: the HLS variants end with a flag whose value is the appended
    // stream address (`-hls_base_url <address>` / `-segment_list_entry_prefix
    // <address>`); the address doubles as that value.
    pub fn mux_options(self) -> &'static [&'static str] {
        match self {
            StreamTarget::Udp => &["-f", "mpegts"],
            StreamTarget::Rtp => &["-f", "rtp_mpegts"],
            StreamTarget::Rtsp => &["-f", "rtsp"],
            StreamTarget::Hls => &[
                "-f", "hls",
                "-hls_flags", "delete_segments",
                "-hls_init_time", "0.5",
                "-hls_time", "0.5",
                "-hls_list_size", "10",
                "-hls_allow_cache", "1",
                "-hls_base_url",
            ],
            StreamTarget::HlsSegment => &[
                "-f", "segment",
                "-segment_list_type", "m3u8",
                "-segment_list_size", "10",
                "-segment_list_flags", "+live",
                "-segment_time", "1",
                "-segment_wrap", "10",
                "-segment_list_entry_prefix",
            ],
            StreamTarget::Rtmp => &["-f", "flv"],
        }
    }
}

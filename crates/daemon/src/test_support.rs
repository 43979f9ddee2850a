//! Helpers shared by the process-level tests: stand-in encoder scripts and
//! fixed probers.

use crate::probe::{MediaInfo, MediaProber, ProbeError};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Shell prelude that sets `$input` (the `-i` argument) and `$out` (the last argument).
const ARG_PRELUDE: &str = r#"prev=""
for arg; do
  if [ "$prev" = "-i" ]; then input="$arg"; fi
  prev="$arg"
done
out="$prev"
"#;

/// Writes an executable `/bin/sh` script standing in for ffmpeg.
pub fn write_encoder_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}{}\n", ARG_PRELUDE, body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Encoder that writes `encoded` to its output and reports one progress block.
pub fn successful_encoder(dir: &Path) -> PathBuf {
    write_encoder_script(
        dir,
        "fake-ffmpeg-ok",
        r#"printf 'encoded' > "$out"
echo "frame=150"
echo "fps=30.0"
echo "progress=continue"
echo "progress=end"
exit 0"#,
    )
}

/// Encoder that leaves a partial output behind and exits with code 3.
pub fn failing_encoder(dir: &Path) -> PathBuf {
    write_encoder_script(
        dir,
        "fake-ffmpeg-fail",
        r#"printf 'partial' > "$out"
echo "Conversion failed!" >&2
exit 3"#,
    )
}

/// Encoder that appends its input path to `order_file` before succeeding.
pub fn recording_encoder(dir: &Path, order_file: &Path) -> PathBuf {
    write_encoder_script(
        dir,
        "fake-ffmpeg-record",
        &format!(
            r#"echo "$input" >> "{}"
printf 'encoded' > "$out"
echo "progress=end"
exit 0"#,
            order_file.display()
        ),
    )
}

/// Encoder that writes a partial output then blocks until killed.
pub fn hanging_encoder(dir: &Path) -> PathBuf {
    write_encoder_script(
        dir,
        "fake-ffmpeg-hang",
        r#"printf 'partial' > "$out"
exec sleep 30"#,
    )
}

/// Prober returning fixed media info.
pub struct StaticProber(pub MediaInfo);

impl MediaProber for StaticProber {
    fn probe(&self, _path: &Path) -> Result<MediaInfo, ProbeError> {
        Ok(self.0.clone())
    }
}

/// Prober that always fails.
pub struct FailingProber;

impl MediaProber for FailingProber {
    fn probe(&self, _path: &Path) -> Result<MediaInfo, ProbeError> {
        Err(ProbeError::FfprobeFailed("no prober in tests".to_string()))
    }
}

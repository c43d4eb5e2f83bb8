//! Stub worker programs for exercising the supervisor
//!
//! Each stub is a POSIX shell script invoked as
//! `sh <script> --image_a <path> --image_b <path> --aoi <aoi> --out_dir <dir>`.

/// Finds `--out_dir`, records the full argument list and writes both
/// artifacts after a short delay.
pub const SUCCESS_WORKER: &str = r#"
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--out_dir" ]; then out="$arg"; fi
  prev="$arg"
done
sleep 0.3
echo "clipping into $out"
printf '%s\n' "$@" > "$out/args.txt"
printf 'A' > "$out/A_clipped.tif"
printf 'B' > "$out/B_clipped_aligned.tif"
exit 0
"#;

/// Reports a diagnostic on stderr and exits 1.
pub const FAILING_WORKER: &str = r#"
sleep 0.3
echo "reading inputs"
printf '%s' "alignment failed: insufficient overlap" >&2
exit 1
"#;

/// Exits nonzero without writing anything to stderr.
pub const SILENT_FAILING_WORKER: &str = r#"
sleep 0.1
exit 3
"#;

/// Claims success without producing any artifact.
pub const NO_ARTIFACT_WORKER: &str = r#"
sleep 0.1
exit 0
"#;

/// Runs until killed.
pub const SLOW_WORKER: &str = r#"
exec sleep 30
"#;

/// Exits 0 at once but leaves a background process holding its output
/// pipes open for two seconds.
pub const LINGERING_OUTPUT_WORKER: &str = r#"
sleep 2 &
exit 0
"#;

/// Replaces the job document with garbage before exiting 0 and restores it
/// 300 ms later, so the first attempt at recording the outcome fails.
pub const STORE_BREAKING_WORKER: &str = r#"
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--out_dir" ]; then out="$arg"; fi
  prev="$arg"
done
sleep 0.2
doc="$out/../../jobs.json"
cp "$doc" "$doc.saved"
printf 'garbage' > "$doc"
( sleep 0.3; mv "$doc.saved" "$doc" ) >/dev/null 2>&1 &
exit 0
"#;

/// AOI used by the scenario tests.
pub const SCENARIO_AOI: raster_align::models::job::Aoi = raster_align::models::job::Aoi {
    north: 10.0,
    south: 0.0,
    east: 10.0,
    west: 0.0,
};

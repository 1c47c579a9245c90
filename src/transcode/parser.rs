use once_cell::sync::Lazy;
use regex::Regex;

/// Cross-chunk parser state. The status grammar needs nothing carried between
/// lines except "duration already captured"; the caller threads this value
/// through every `parse_line` call of one run.
#[derive(Debug, Clone, Default)]
pub struct ParseState {
    pub duration_seconds: Option<f64>,
}

/// One snapshot of encoder throughput/position. Every field is independently
/// optional: the tool punches holes in its own format (`N/A`, omitted keys).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub q: Option<f64>,
    pub size_bytes: Option<u64>,
    pub time_seconds: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub duplicates: Option<u64>,
    pub dropped: Option<u64>,
    pub speed: Option<f64>,
}

/// Stream header info, captured once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderInfo {
    pub duration_seconds: f64,
    pub start_seconds: Option<f64>,
    pub bitrate_kbps: Option<f64>,
}

/// Per-stream-class byte counts from the tool's closing summary line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalSizes {
    pub video_bytes: u64,
    pub audio_bytes: u64,
    pub subtitle_bytes: u64,
    pub other_streams_bytes: u64,
    pub global_headers_bytes: u64,
    pub muxing_overhead_percent: Option<f64>,
}

/// A recognized occurrence on the status channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLine {
    Header(HeaderInfo),
    Progress(ProgressSample),
    Writing { file: String },
    Sizes(FinalSizes),
}

static DURATION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Duration:\s*(\d+):(\d{2}):(\d{2})\.(\d+)(?:,\s*start:\s*(-?\d+(?:\.\d+)?))?(?:,\s*bitrate:\s*(\d+(?:\.\d+)?)\s*kb/s)?",
    )
    .unwrap()
});

static WRITING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Opening '(.+?)' for writing").unwrap());

static SIZES_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"video:\s*(\d+)(?:\.\d+)?kB\s+audio:\s*(\d+)(?:\.\d+)?kB\s+subtitle:\s*(\d+)(?:\.\d+)?kB\s+other streams:\s*(\d+)(?:\.\d+)?kB\s+global headers:\s*(\d+)(?:\.\d+)?kB(?:\s+muxing overhead:\s*(\d+(?:\.\d+)?)%)?",
    )
    .unwrap()
});

static FRAME_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"frame=\s*(\d+)").unwrap());
static FPS_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"fps=\s*(\d+(?:\.\d+)?)").unwrap());
static Q_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"q=\s*(-?\d+(?:\.\d+)?)").unwrap());
static SIZE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"L?size=\s*(\d+(?:\.\d+)?)\s*(k|m|g)?B").unwrap());
static TIME_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2})(?:\.(\d+))?").unwrap());
static BITRATE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bitrate=\s*(\d+(?:\.\d+)?)\s*(k|m|g)?bits/s").unwrap());
static DUP_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"dup=\s*(\d+)").unwrap());
static DROP_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"drop=\s*(\d+)").unwrap());
static SPEED_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").unwrap());

/// Classify one status line. `None` means the line carries nothing the
/// supervisor cares about.
pub fn parse_line(state: &mut ParseState, line: &str) -> Option<StatusLine> {
    if let Some(captures) = WRITING_LINE.captures(line) {
        return Some(StatusLine::Writing {
            file: captures[1].to_string(),
        });
    }

    if let Some(captures) = SIZES_LINE.captures(line) {
        return Some(StatusLine::Sizes(FinalSizes {
            video_bytes: parse_kb(&captures[1]),
            audio_bytes: parse_kb(&captures[2]),
            subtitle_bytes: parse_kb(&captures[3]),
            other_streams_bytes: parse_kb(&captures[4]),
            global_headers_bytes: parse_kb(&captures[5]),
            muxing_overhead_percent: captures.get(6).and_then(|m| m.as_str().parse().ok()),
        }));
    }

    if let Some(captures) = DURATION_LINE.captures(line) {
        // First match only; later inputs print their own header lines.
        if state.duration_seconds.is_none() {
            let duration = clock_to_seconds(&captures[1], &captures[2], &captures[3], Some(&captures[4]));
            state.duration_seconds = Some(duration);
            return Some(StatusLine::Header(HeaderInfo {
                duration_seconds: duration,
                start_seconds: captures.get(5).and_then(|m| m.as_str().parse().ok()),
                bitrate_kbps: captures.get(6).and_then(|m| m.as_str().parse().ok()),
            }));
        }
        return None;
    }

    let time_seconds = TIME_KEY.captures(line).map(|captures| {
        clock_to_seconds(
            &captures[1],
            &captures[2],
            &captures[3],
            captures.get(4).map(|m| m.as_str()),
        )
    });
    // time= is the mandatory key; a sample without it is not emitted.
    let time_seconds = time_seconds?;

    Some(StatusLine::Progress(ProgressSample {
        frame: capture_u64(&FRAME_KEY, line),
        fps: capture_f64(&FPS_KEY, line),
        q: capture_f64(&Q_KEY, line),
        size_bytes: SIZE_KEY.captures(line).and_then(|captures| {
            let value: f64 = captures[1].parse().ok()?;
            let unit = captures.get(2).map(|m| m.as_str()).unwrap_or("");
            Some((value * size_unit_factor(unit)) as u64)
        }),
        time_seconds: Some(time_seconds),
        bitrate_kbps: BITRATE_KEY.captures(line).and_then(|captures| {
            let value: f64 = captures[1].parse().ok()?;
            let unit = captures.get(2).map(|m| m.as_str()).unwrap_or("");
            Some(value * bitrate_unit_factor(unit))
        }),
        duplicates: capture_u64(&DUP_KEY, line),
        dropped: capture_u64(&DROP_KEY, line),
        speed: capture_f64(&SPEED_KEY, line),
    }))
}

/// Completion percentage for a progress sample. Never reads 100 just because
/// the duration is unknown.
pub fn percent(time_seconds: f64, duration_seconds: Option<f64>) -> f64 {
    match duration_seconds {
        Some(duration) if duration > 0.0 => {
            let raw = time_seconds / duration * 100.0;
            let rounded = (raw * 100.0).round() / 100.0;
            rounded.clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

fn capture_u64(pattern: &Regex, line: &str) -> Option<u64> {
    pattern.captures(line).and_then(|c| c[1].parse().ok())
}

fn capture_f64(pattern: &Regex, line: &str) -> Option<f64> {
    pattern.captures(line).and_then(|c| c[1].parse().ok())
}

fn clock_to_seconds(hours: &str, minutes: &str, seconds: &str, fraction: Option<&str>) -> f64 {
    let hours: f64 = hours.parse().unwrap_or(0.0);
    let minutes: f64 = minutes.parse().unwrap_or(0.0);
    let seconds: f64 = seconds.parse().unwrap_or(0.0);
    let fraction = fraction
        .and_then(|digits| {
            let value: f64 = digits.parse().ok()?;
            Some(value / 10f64.powi(digits.len() as i32))
        })
        .unwrap_or(0.0);
    hours * 3600.0 + minutes * 60.0 + seconds + fraction
}

fn parse_kb(digits: &str) -> u64 {
    digits.parse::<u64>().unwrap_or(0) * 1024
}

fn size_unit_factor(unit: &str) -> f64 {
    match unit {
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

fn bitrate_unit_factor(unit: &str) -> f64 {
    match unit {
        "k" => 1.0,
        "m" => 1000.0,
        "g" => 1_000_000.0,
        _ => 0.001,
    }
}

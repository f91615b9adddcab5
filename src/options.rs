use std::collections::HashMap;

use sha2::{Digest, Sha256};
use strum_macros::{Display, EnumString};

use crate::config::DerivativeConfig;
use crate::error::Error;

/// Transformation mode. Exactly one per request; `video` when unspecified.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, serde::Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Video,
    Frame,
    Spritesheet,
}

/// Normalized transform options. Absent fields are omitted from the upstream
/// URL; numeric fields are strictly parsed.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TransformOptions {
    pub mode: Mode,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub compression: Option<String>,
    pub time: Option<String>,
    pub duration: Option<String>,
    pub fps: Option<u32>,
    pub audio: Option<bool>,
    #[serde(rename = "loop")]
    pub loop_: Option<bool>,
    pub autoplay: Option<bool>,
    pub muted: Option<bool>,
    pub preload: Option<String>,
    pub derivative: Option<String>,
}

/// Requested IMQuery dimensions, kept for Cache-Tag emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub options: TransformOptions,
    pub imquery: Option<ImQuery>,
    pub warnings: Vec<String>,
}

/// Normalized options as attached to the request, for downstream layers.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub options: TransformOptions,
    pub imquery: Option<ImQuery>,
}

/// Render a millisecond duration in the upstream time grammar.
pub fn format_duration_ms(ms: u64) -> String {
    if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}ms", ms)
    }
}

/// Map an `Accept` hint to a default frame container. This is the whole of
/// content negotiation: anything further is the upstream's business.
pub fn format_from_accept(accept: &str) -> Option<&'static str> {
    if accept.contains("image/avif") {
        Some("avif")
    } else if accept.contains("image/webp") {
        Some("webp")
    } else {
        None
    }
}

/// Request-parameter aliases, mapped through a single table.
const PARAM_ALIASES: &[(&str, &str)] = &[
    ("width", "width"),
    ("w", "width"),
    ("height", "height"),
    ("h", "height"),
    ("mode", "mode"),
    ("fit", "fit"),
    ("quality", "quality"),
    ("q", "quality"),
    ("format", "format"),
    ("compression", "compression"),
    ("time", "time"),
    ("start", "time"),
    ("duration", "duration"),
    ("dur", "duration"),
    ("fps", "fps"),
    ("audio", "audio"),
    ("loop", "loop"),
    ("autoplay", "autoplay"),
    ("muted", "muted"),
    ("preload", "preload"),
    ("derivative", "derivative"),
    ("imwidth", "imwidth"),
    ("imheight", "imheight"),
];

/// Canonical upstream serialization order.
const PARAM_ORDER: &[&str] = &[
    "width",
    "height",
    "mode",
    "fit",
    "quality",
    "format",
    "compression",
    "time",
    "duration",
    "fps",
    "audio",
    "loop",
    "autoplay",
    "muted",
    "preload",
];

/// Allowed parameters per mode. Anything outside the set is omitted from the
/// upstream URL and recorded as a warning.
fn allowed_params(mode: Mode) -> &'static [&'static str] {
    match mode {
        Mode::Video => &[
            "width", "height", "mode", "fit", "quality", "compression", "time", "duration",
            "fps", "audio", "loop", "autoplay", "muted", "preload",
        ],
        Mode::Frame => &["width", "height", "mode", "fit", "quality", "format", "time"],
        Mode::Spritesheet => &["width", "height", "mode", "fit", "time", "duration"],
    }
}

fn canonical_param(name: &str) -> Option<&'static str> {
    PARAM_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
}

/// Whether a query parameter belongs to the transform language (and is thus
/// stripped from forwarded origin URLs).
pub fn is_transform_param(name: &str) -> bool {
    canonical_param(name).is_some()
}

fn parse_u32(param: &str, value: &str) -> Result<u32, Error> {
    value
        .parse::<u32>()
        .map_err(|_| Error::invalid_option(param, format!("expected a non-negative integer, got {:?}", value)))
}

fn parse_bool(param: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::invalid_option(
            param,
            format!("expected true or false, got {:?}", value),
        )),
    }
}

fn parse_time(param: &str, value: &str) -> Result<String, Error> {
    let digits = value.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let unit = &value[digits.len()..];
    let valid = !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        && matches!(unit, "s" | "ms" | "m");
    if !valid {
        return Err(Error::invalid_option(
            param,
            format!("expected a value like 5s or 500ms, got {:?}", value),
        ));
    }
    Ok(value.to_string())
}

/// Time value in milliseconds, for limit comparisons.
pub fn time_value_ms(value: &str) -> Option<u64> {
    let digits = value.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let n: u64 = digits.parse().ok()?;
    match &value[digits.len()..] {
        "ms" => Some(n),
        "s" => Some(n * 1_000),
        "m" => Some(n * 60_000),
        _ => None,
    }
}

/// Parse request-derived parameters into [`TransformOptions`], expanding
/// derivatives and IMQuery dimensions.
pub fn normalize(
    pairs: &[(String, String)],
    derivatives: &HashMap<String, DerivativeConfig>,
) -> Result<NormalizeOutcome, Error> {
    let mut opts = TransformOptions::default();
    let mut imquery = ImQuery::default();
    let mut warnings = Vec::new();
    let mut explicit_derivative: Option<String> = None;

    for (name, value) in pairs {
        let Some(canonical) = canonical_param(name) else {
            continue;
        };

        match canonical {
            "width" => opts.width = Some(parse_u32(name, value)?),
            "height" => opts.height = Some(parse_u32(name, value)?),
            "mode" => {
                opts.mode = value.parse().map_err(|_| {
                    Error::invalid_option(name.as_str(), format!("unknown mode {:?}", value))
                })?
            }
            "fit" => opts.fit = Some(value.clone()),
            "quality" => opts.quality = Some(value.clone()),
            "format" => opts.format = Some(value.clone()),
            "compression" => opts.compression = Some(value.clone()),
            "time" => opts.time = Some(parse_time(name, value)?),
            "duration" => opts.duration = Some(parse_time(name, value)?),
            "fps" => {
                let fps = parse_u32(name, value)?;
                if fps == 0 {
                    return Err(Error::invalid_option(name.as_str(), "fps must be positive"));
                }
                opts.fps = Some(fps);
            }
            "audio" => opts.audio = Some(parse_bool(name, value)?),
            "loop" => opts.loop_ = Some(parse_bool(name, value)?),
            "autoplay" => opts.autoplay = Some(parse_bool(name, value)?),
            "muted" => opts.muted = Some(parse_bool(name, value)?),
            "preload" => opts.preload = Some(value.clone()),
            "derivative" => explicit_derivative = Some(value.clone()),
            "imwidth" => imquery.width = Some(parse_u32(name, value)?),
            "imheight" => imquery.height = Some(parse_u32(name, value)?),
            _ => {}
        }
    }

    // IMQuery dimensions select the closest derivative unless one was named.
    let derivative = match explicit_derivative {
        Some(name) => Some(name),
        None => imquery
            .width
            .and_then(|w| closest_derivative(w, derivatives)),
    };

    if let Some(name) = derivative {
        let Some(preset) = derivatives.get(&name) else {
            return Err(Error::new(crate::error::ErrorKind::UnknownDerivative(name)));
        };

        // Preset dimensions override whatever was explicit; the remaining
        // preset fields only fill gaps the caller left.
        opts.width = Some(preset.width);
        opts.height = Some(preset.height);
        if opts.quality.is_none() {
            opts.quality = preset.quality.clone();
        }
        if opts.compression.is_none() {
            opts.compression = preset.compression.clone();
        }
        if opts.duration.is_none() {
            opts.duration = preset.duration.clone();
        }
        if opts.fps.is_none() {
            opts.fps = preset.fps;
        }
        if opts.audio.is_none() {
            opts.audio = preset.audio;
        }
        opts.derivative = Some(name);
    }

    for dropped in opts.gated_names() {
        warnings.push(format!(
            "parameter {} is not valid in {} mode and was dropped",
            dropped, opts.mode
        ));
    }

    let imquery = (imquery.width.is_some() || imquery.height.is_some()).then_some(imquery);

    Ok(NormalizeOutcome {
        options: opts,
        imquery,
        warnings,
    })
}

fn closest_derivative(
    width: u32,
    derivatives: &HashMap<String, DerivativeConfig>,
) -> Option<String> {
    derivatives
        .iter()
        .min_by_key(|(_, d)| d.width.abs_diff(width))
        .map(|(name, _)| name.clone())
}

impl TransformOptions {
    fn raw_param(&self, name: &str) -> Option<String> {
        match name {
            "width" => self.width.map(|v| v.to_string()),
            "height" => self.height.map(|v| v.to_string()),
            "mode" => Some(self.mode.to_string()),
            "fit" => self.fit.clone(),
            "quality" => self.quality.clone(),
            "format" => self.format.clone(),
            "compression" => self.compression.clone(),
            "time" => self.time.clone(),
            "duration" => self.duration.clone(),
            "fps" => self.fps.map(|v| v.to_string()),
            "audio" => self.audio.map(|v| v.to_string()),
            "loop" => self.loop_.map(|v| v.to_string()),
            "autoplay" => self.autoplay.map(|v| v.to_string()),
            "muted" => self.muted.map(|v| v.to_string()),
            "preload" => self.preload.clone(),
            _ => None,
        }
    }

    /// Parameters set outside the mode's allowed set.
    pub fn gated_names(&self) -> Vec<&'static str> {
        let allowed = allowed_params(self.mode);
        PARAM_ORDER
            .iter()
            .filter(|name| self.raw_param(name).is_some() && !allowed.contains(*name))
            .copied()
            .collect()
    }

    /// Upstream parameters in canonical order, with mode gating applied.
    pub fn upstream_params(&self) -> Vec<(&'static str, String)> {
        let allowed = allowed_params(self.mode);
        PARAM_ORDER
            .iter()
            .filter(|name| allowed.contains(*name))
            .filter_map(|name| self.raw_param(name).map(|v| (*name, v)))
            .collect()
    }

    /// Canonical key material: sorted fields, defaults omitted, derivative
    /// absorbed into its expansion so equal option sets hash identically.
    pub fn canonicalize(&self) -> String {
        let mut fields: Vec<(&'static str, String)> = PARAM_ORDER
            .iter()
            .filter_map(|name| self.raw_param(name).map(|v| (*name, v)))
            .filter(|(name, value)| !(*name == "mode" && value == "video"))
            .collect();
        fields.sort_by_key(|(name, _)| *name);

        fields
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Content-addressed variant key for `(path, options, version)`.
pub fn variant_key(path: &str, opts: &TransformOptions, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(opts.canonicalize().as_bytes());
    hasher.update(b"|v");
    hasher.update(version.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derivatives() -> HashMap<String, DerivativeConfig> {
        let mut map = HashMap::new();
        map.insert(
            "medium".to_string(),
            DerivativeConfig {
                width: 854,
                height: 480,
                quality: Some("medium".into()),
                ..Default::default()
            },
        );
        map.insert(
            "mobile".to_string(),
            DerivativeConfig {
                width: 480,
                height: 270,
                ..Default::default()
            },
        );
        map
    }

    fn pairs(src: &[(&str, &str)]) -> Vec<(String, String)> {
        src.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn derivative_dimensions_override_explicit() {
        let out = normalize(
            &pairs(&[("width", "1920"), ("derivative", "medium")]),
            &derivatives(),
        )
        .unwrap();
        assert_eq!(out.options.width, Some(854));
        assert_eq!(out.options.height, Some(480));
        // preset quality fills the gap the caller left
        assert_eq!(out.options.quality.as_deref(), Some("medium"));
    }

    #[test]
    fn explicit_quality_survives_derivative() {
        let out = normalize(
            &pairs(&[("quality", "high"), ("derivative", "medium")]),
            &derivatives(),
        )
        .unwrap();
        assert_eq!(out.options.quality.as_deref(), Some("high"));
    }

    #[test]
    fn unknown_derivative_fails() {
        let err = normalize(&pairs(&[("derivative", "giant")]), &derivatives()).unwrap_err();
        assert_eq!(err.kind_tag(), "UnknownDerivative");
    }

    #[test]
    fn strict_numeric_parsing_names_the_parameter() {
        let err = normalize(&pairs(&[("width", "wide")]), &derivatives()).unwrap_err();
        assert_eq!(err.kind_tag(), "InvalidOption");
        assert!(err.to_string().contains("width"));
    }

    #[test]
    fn fps_must_be_positive() {
        let err = normalize(&pairs(&[("fps", "0")]), &derivatives()).unwrap_err();
        assert_eq!(err.kind_tag(), "InvalidOption");
    }

    #[test]
    fn time_values_are_validated() {
        assert!(normalize(&pairs(&[("time", "5s")]), &derivatives()).is_ok());
        assert!(normalize(&pairs(&[("duration", "500ms")]), &derivatives()).is_ok());
        assert!(normalize(&pairs(&[("time", "fast")]), &derivatives()).is_err());
    }

    #[test]
    fn mode_gating_drops_and_warns() {
        let out = normalize(
            &pairs(&[("mode", "frame"), ("duration", "5s"), ("width", "640")]),
            &derivatives(),
        )
        .unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("duration"));

        let params = out.options.upstream_params();
        assert!(params.iter().all(|(name, _)| *name != "duration"));
        assert!(params.iter().any(|(name, _)| *name == "width"));
    }

    #[test]
    fn upstream_params_follow_canonical_order() {
        let out = normalize(
            &pairs(&[("muted", "true"), ("height", "480"), ("width", "854")]),
            &derivatives(),
        )
        .unwrap();
        let names: Vec<_> = out
            .options
            .upstream_params()
            .iter()
            .map(|(n, _)| *n)
            .collect();
        assert_eq!(names, vec!["width", "height", "mode", "muted"]);
    }

    #[test]
    fn imquery_selects_closest_derivative() {
        let out = normalize(&pairs(&[("imwidth", "500")]), &derivatives()).unwrap();
        assert_eq!(out.options.derivative.as_deref(), Some("mobile"));
        assert_eq!(out.options.width, Some(480));
        assert_eq!(out.imquery.unwrap().width, Some(500));
    }

    #[test]
    fn canonicalization_is_order_and_default_insensitive() {
        let a = normalize(
            &pairs(&[("width", "854"), ("height", "480"), ("mode", "video")]),
            &derivatives(),
        )
        .unwrap()
        .options;
        let b = normalize(
            &pairs(&[("height", "480"), ("width", "854")]),
            &derivatives(),
        )
        .unwrap()
        .options;

        assert_eq!(a.canonicalize(), b.canonicalize());
        assert_eq!(
            variant_key("/videos/clip.mp4", &a, 1),
            variant_key("/videos/clip.mp4", &b, 1)
        );
    }

    #[test]
    fn version_changes_the_variant_key() {
        let opts = TransformOptions {
            width: Some(854),
            ..Default::default()
        };
        assert_ne!(
            variant_key("/videos/clip.mp4", &opts, 1),
            variant_key("/videos/clip.mp4", &opts, 2)
        );
    }

    #[test]
    fn accept_hint_maps_to_a_default_container() {
        assert_eq!(format_from_accept("image/avif,image/webp,*/*"), Some("avif"));
        assert_eq!(format_from_accept("image/webp,*/*"), Some("webp"));
        assert_eq!(format_from_accept("*/*"), None);
    }

    #[test]
    fn time_value_conversions() {
        assert_eq!(time_value_ms("30s"), Some(30_000));
        assert_eq!(time_value_ms("500ms"), Some(500));
        assert_eq!(time_value_ms("2m"), Some(120_000));
        assert_eq!(time_value_ms("abc"), None);
    }
}

//! Turns the two inbound encodings (multipart form, JSON document) into one
//! canonical [`GenerationRequest`].

use crate::config::{GenerationDefaults, MAX_INPUT_IMAGES};
use crate::error::GatewayError;
use axum::extract::Multipart;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;

const REFERENCE_IMAGE_PREFIX: &str = "input_image_";
const TEXT_FIELDS: &[&str] = &["prompt", "input", "steps", "width", "height", "seed"];

const DATA_URI_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

impl ReferenceImage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
            file_name: None,
        }
    }
}

/// Canonical generation request. The prompt is never blank and there are never
/// more than `MAX_INPUT_IMAGES` reference images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    prompt: String,
    steps: u32,
    width: u32,
    height: u32,
    seed: Option<i64>,
    reference_images: Vec<ReferenceImage>,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        defaults: GenerationDefaults,
    ) -> Result<Self, GatewayError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(GatewayError::Validation("Prompt is required".to_string()));
        }
        Ok(Self {
            prompt,
            steps: defaults.steps,
            width: defaults.width,
            height: defaults.height,
            seed: None,
            reference_images: Vec::new(),
        })
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self
    }

    /// Extra images past `MAX_INPUT_IMAGES` are dropped.
    pub fn with_reference_images(mut self, mut images: Vec<ReferenceImage>) -> Self {
        images.truncate(MAX_INPUT_IMAGES);
        self.reference_images = images;
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn seed(&self) -> Option<i64> {
        self.seed
    }

    pub fn reference_images(&self) -> &[ReferenceImage] {
        &self.reference_images
    }
}

/// Fields and file parts of a multipart body, collected before normalization.
/// The first occurrence of a name wins.
#[derive(Debug, Clone, Default)]
pub struct RawForm {
    pub fields: HashMap<String, String>,
    pub files: HashMap<String, ReferenceImage>,
}

impl RawForm {
    pub fn text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.entry(name.to_string()).or_insert(value.into());
        self
    }

    pub fn file(mut self, name: &str, image: ReferenceImage) -> Self {
        self.files.entry(name.to_string()).or_insert(image);
        self
    }
}

pub async fn read_multipart(mut multipart: Multipart) -> Result<RawForm, GatewayError> {
    let mut form = RawForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| GatewayError::InvalidBody(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if reference_slot(&name).is_some() {
            // Plain text parts under an image name are not images.
            if field.file_name().is_none() {
                continue;
            }
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let data = field.bytes().await.map_err(|err| {
                GatewayError::InvalidBody(format!("failed to read {name}: {err}"))
            })?;
            form = form.file(
                &name,
                ReferenceImage {
                    data,
                    content_type,
                    file_name,
                },
            );
        } else if TEXT_FIELDS.contains(&name.as_str()) {
            let value = field.text().await.map_err(|err| {
                GatewayError::InvalidBody(format!("failed to read {name}: {err}"))
            })?;
            form = form.text(&name, value);
        }
    }
    Ok(form)
}

pub fn normalize_form(
    mut form: RawForm,
    defaults: GenerationDefaults,
) -> Result<GenerationRequest, GatewayError> {
    let prompt = ["prompt", "input"]
        .iter()
        .filter_map(|key| form.fields.get(*key))
        .find(|value| !value.trim().is_empty())
        .cloned()
        .unwrap_or_default();

    let images: Vec<ReferenceImage> = (0..MAX_INPUT_IMAGES)
        .filter_map(|slot| form.files.remove(&format!("{REFERENCE_IMAGE_PREFIX}{slot}")))
        .filter(|image| !image.data.is_empty())
        .collect();

    let field = |key: &str| form.fields.get(key).map(String::as_str);
    Ok(GenerationRequest::new(prompt, defaults)?
        .with_steps(parse_dimension(field("steps")).unwrap_or(defaults.steps))
        .with_size(
            parse_dimension(field("width")).unwrap_or(defaults.width),
            parse_dimension(field("height")).unwrap_or(defaults.height),
        )
        .with_seed(field("seed").and_then(parse_seed))
        .with_reference_images(images))
}

pub fn normalize_json(
    body: &Value,
    defaults: GenerationDefaults,
) -> Result<GenerationRequest, GatewayError> {
    let obj = body.as_object().ok_or_else(|| {
        GatewayError::InvalidBody("request body must be a JSON object".to_string())
    })?;

    let prompt = ["prompt", "input"]
        .iter()
        .filter_map(|key| obj.get(*key))
        .filter_map(prompt_text)
        .find(|text| !text.trim().is_empty())
        .unwrap_or_default();

    let images: Vec<ReferenceImage> = obj
        .get("images")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .take(MAX_INPUT_IMAGES)
                .filter_map(Value::as_str)
                .filter_map(decode_data_uri)
                .collect()
        })
        .unwrap_or_default();

    Ok(GenerationRequest::new(prompt, defaults)?
        .with_steps(json_dimension(obj.get("steps")).unwrap_or(defaults.steps))
        .with_size(
            json_dimension(obj.get("width")).unwrap_or(defaults.width),
            json_dimension(obj.get("height")).unwrap_or(defaults.height),
        )
        .with_seed(obj.get("seed").and_then(json_seed))
        .with_reference_images(images))
}

/// Decodes `data:image/<type>[;base64],<payload>` into a blob. Anything else,
/// or a payload that fails to decode, yields `None`.
pub fn decode_data_uri(uri: &str) -> Option<ReferenceImage> {
    let rest = strip_prefix_ignore_case(uri.trim(), "data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mut params = meta.split(';');
    let media_type = params.next().unwrap_or_default().trim();
    if !media_type.to_ascii_lowercase().starts_with("image/") {
        return None;
    }
    let is_base64 = params.any(|p| p.trim().eq_ignore_ascii_case("base64"));

    let data = if is_base64 {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        DATA_URI_BASE64.decode(compact.as_bytes()).ok()?
    } else {
        percent_encoding::percent_decode_str(payload).collect::<Vec<u8>>()
    };
    if data.is_empty() {
        return None;
    }

    let extension = media_type
        .split_once('/')
        .map(|(_, sub)| sub.split('+').next().unwrap_or(sub).to_string())
        .unwrap_or_else(|| "png".to_string());
    Some(ReferenceImage {
        data: Bytes::from(data),
        content_type: Some(media_type.to_string()),
        file_name: Some(format!("image.{extension}")),
    })
}

fn reference_slot(name: &str) -> Option<usize> {
    name.strip_prefix(REFERENCE_IMAGE_PREFIX)?
        .parse::<usize>()
        .ok()
        .filter(|slot| *slot < MAX_INPUT_IMAGES)
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

fn prompt_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

/// Whole positive integers only; `"4.5"` or `"512px"` fall back to the default.
fn parse_dimension(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
}

fn json_dimension(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::String(s) => parse_dimension(Some(s.as_str())),
        other => json_integer(other)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0),
    }
}

fn parse_seed(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

fn json_seed(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_seed(s),
        other => json_integer(other),
    }
}

fn json_integer(value: &Value) -> Option<i64> {
    if let Some(v) = value.as_i64() {
        return Some(v);
    }
    let f = value.as_f64()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

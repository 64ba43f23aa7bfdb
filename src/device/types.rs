// Core types for device state capture

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

use image::imageops::FilterType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Columns of the normalized luminance grid
pub const GRID_COLS: u32 = 18;
/// Rows of the normalized luminance grid
pub const GRID_ROWS: u32 = 32;
/// Top grid rows covered by the status bar, ignored when comparing screens
pub const MASKED_ROWS: u32 = 2;
/// Luminance bits dropped when quantizing a grid cell
const QUANTIZE_SHIFT: u8 = 5;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Error types for device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The UI hierarchy was empty or could not be parsed
    #[error("enumeration failed: {0}")]
    Enumeration(String),

    /// A single action could not be carried out (includes timeouts)
    #[error("action '{action}' failed: {reason}")]
    ActionExecution { action: String, reason: String },

    /// Snapshot, restore or capture infrastructure failed
    #[error("emulator error: {0}")]
    Emulator(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Stable name used when the error is written to the run record
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::Enumeration(_) => "EnumerationError",
            DeviceError::ActionExecution { .. } => "ActionExecutionError",
            DeviceError::Emulator(_) | DeviceError::Io(_) => "EmulatorError",
        }
    }
}

impl From<image::ImageError> for DeviceError {
    fn from(err: image::ImageError) -> Self {
        DeviceError::Emulator(format!("screenshot decode failed: {}", err))
    }
}

/// Screen rectangle in device pixels (right/bottom exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

static BOUNDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]$").expect("valid bounds regex")
});

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Parse the `[l,t][r,b]` notation used by uiautomator dumps
    pub fn parse(s: &str) -> Option<Self> {
        let caps = BOUNDS_RE.captures(s.trim())?;
        let n = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<i32>().ok());
        Some(Self::new(n(1)?, n(2)?, n(3)?, n(4)?))
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

/// A single widget from the UI hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UiElement {
    /// Class short name (e.g. `Button`, `EditText`)
    pub kind: String,
    pub bounds: Bounds,
    pub text: String,
    pub content_desc: String,
    pub hint: String,
    pub resource_id: String,
    pub package: String,
    pub clickable: bool,
    pub long_clickable: bool,
    pub scrollable: bool,
    pub editable: bool,
    pub checked: bool,
    pub enabled: bool,
}

impl UiElement {
    pub fn new(kind: impl Into<String>, bounds: Bounds) -> Self {
        Self {
            kind: kind.into(),
            bounds,
            enabled: true,
            ..Default::default()
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn content_desc(mut self, desc: impl Into<String>) -> Self {
        self.content_desc = desc.into();
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = hint.into();
        self
    }

    pub fn resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = id.into();
        self
    }

    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.package = package.into();
        self
    }

    pub fn clickable(mut self) -> Self {
        self.clickable = true;
        self
    }

    pub fn long_clickable(mut self) -> Self {
        self.long_clickable = true;
        self
    }

    pub fn scrollable(mut self) -> Self {
        self.scrollable = true;
        self
    }

    pub fn editable(mut self) -> Self {
        self.editable = true;
        self.clickable = true;
        self
    }

    /// Whether any action can target this element
    pub fn is_actionable(&self) -> bool {
        self.enabled && (self.clickable || self.long_clickable || self.scrollable || self.editable)
    }

    /// Short human-readable label: text, then description, hint, resource id
    pub fn label(&self) -> String {
        [&self.text, &self.content_desc, &self.hint]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| {
                self.resource_id
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
    }

    /// Noise-normalized signature used for state equality
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}{}{}{}{}{}",
            self.kind,
            self.resource_id,
            self.bounds,
            normalize_text(&self.text),
            normalize_text(&self.content_desc),
            normalize_text(&self.hint),
            self.clickable as u8,
            self.long_clickable as u8,
            self.scrollable as u8,
            self.editable as u8,
            self.checked as u8,
            self.enabled as u8,
        )
    }
}

/// Structural identity of an element across captures
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementKey {
    pub kind: String,
    pub resource_id: String,
    pub bounds: Bounds,
    /// Position among elements sharing kind, resource id and bounds
    pub ordinal: usize,
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.resource_id.rsplit('/').next().unwrap_or_default();
        if id.is_empty() {
            write!(f, "{}@{}", self.kind, self.bounds)?;
        } else {
            write!(f, "{}#{}@{}", self.kind, id, self.bounds)?;
        }
        if self.ordinal > 0 {
            write!(f, "~{}", self.ordinal)?;
        }
        Ok(())
    }
}

static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d{1,2}:\d{2}(:\d{2})?(\s?[ap]\.?m\.?)?\b").expect("valid clock regex")
});

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,4}[-/.]\d{1,2}[-/.]\d{1,4}\b").expect("valid date regex")
});

static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Replace clock and date patterns with placeholders and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let text = DATE_RE.replace_all(text, "<date>");
    let text = CLOCK_RE.replace_all(&text, "<time>");
    SPACE_RE.replace_all(text.trim(), " ").into_owned()
}

/// Captured screenshot with its normalized luminance grid
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    /// PNG-encoded image data
    pub png: Arc<Vec<u8>>,
    /// Quantized luminance, `GRID_COLS * GRID_ROWS` cells, status bar rows zeroed
    pub grid: Vec<u8>,
    /// SHA-256 of the grid, hex encoded
    pub digest: String,
}

impl Screenshot {
    /// Decode PNG bytes and compute the normalized grid
    pub fn from_png(png: Vec<u8>) -> DeviceResult<Self> {
        let img = image::load_from_memory(&png)?;
        let (width, height) = (img.width(), img.height());
        let luma = img.to_luma8();
        let small = image::imageops::resize(&luma, GRID_COLS, GRID_ROWS, FilterType::Triangle);

        let mut grid: Vec<u8> = small.into_raw().into_iter().map(|v| v >> QUANTIZE_SHIFT).collect();
        for cell in grid.iter_mut().take((MASKED_ROWS * GRID_COLS) as usize) {
            *cell = 0;
        }

        let digest = hex::encode(Sha256::digest(&grid));
        Ok(Self {
            width,
            height,
            png: Arc::new(png),
            grid,
            digest,
        })
    }

    /// Number of differing grid cells and their bounding region in device pixels
    pub fn delta(&self, other: &Screenshot) -> (usize, Option<Bounds>) {
        if self.grid.len() != other.grid.len() {
            let full = Bounds::new(0, 0, other.width as i32, other.height as i32);
            return (other.grid.len(), Some(full));
        }

        let mut changed = 0;
        let (mut min_c, mut min_r, mut max_c, mut max_r) = (u32::MAX, u32::MAX, 0, 0);
        for (i, (a, b)) in self.grid.iter().zip(&other.grid).enumerate() {
            if a != b {
                changed += 1;
                let (c, r) = (i as u32 % GRID_COLS, i as u32 / GRID_COLS);
                min_c = min_c.min(c);
                min_r = min_r.min(r);
                max_c = max_c.max(c);
                max_r = max_r.max(r);
            }
        }

        if changed == 0 {
            return (0, None);
        }
        let cell_w = other.width as f64 / GRID_COLS as f64;
        let cell_h = other.height as f64 / GRID_ROWS as f64;
        let region = Bounds::new(
            (min_c as f64 * cell_w) as i32,
            (min_r as f64 * cell_h) as i32,
            ((max_c + 1) as f64 * cell_w).ceil() as i32,
            ((max_r + 1) as f64 * cell_h).ceil() as i32,
        );
        (changed, Some(region))
    }

    /// Number of cells that take part in comparisons
    pub fn compared_cells() -> usize {
        ((GRID_ROWS - MASKED_ROWS) * GRID_COLS) as usize
    }
}

/// Structural and visual state of the screen at one instant
#[derive(Debug, Clone)]
pub struct UiState {
    /// Elements in hierarchy order
    pub elements: Vec<UiElement>,
    pub screenshot: Screenshot,
    /// Foreground package
    pub package: String,
    pub activity: Option<String>,
    /// Crash signature when the app died
    pub crash: Option<String>,
}

impl UiState {
    /// Normalized element signatures in hierarchy order
    pub fn signatures(&self) -> Vec<String> {
        self.elements.iter().map(UiElement::signature).collect()
    }

    /// Structural keys for every element, in hierarchy order
    pub fn keys(&self) -> Vec<ElementKey> {
        let mut seen: HashMap<(String, String, Bounds), usize> = HashMap::new();
        self.elements
            .iter()
            .map(|e| {
                let slot = seen
                    .entry((e.kind.clone(), e.resource_id.clone(), e.bounds))
                    .or_insert(0);
                let key = ElementKey {
                    kind: e.kind.clone(),
                    resource_id: e.resource_id.clone(),
                    bounds: e.bounds,
                    ordinal: *slot,
                };
                *slot += 1;
                key
            })
            .collect()
    }

    /// Find an element by structural key
    pub fn element(&self, key: &ElementKey) -> Option<&UiElement> {
        self.keys()
            .iter()
            .position(|k| k == key)
            .and_then(|i| self.elements.get(i))
    }

    pub fn is_crashed(&self) -> bool {
        self.crash.is_some()
    }

    /// `package/activity` as reported by the device
    pub fn foreground(&self) -> String {
        match &self.activity {
            Some(a) => format!("{}/{}", self.package, a),
            None => self.package.clone(),
        }
    }

    /// Similarity in `0.0..=1.0`; equal states score exactly 1.0
    pub fn similarity(&self, other: &UiState) -> f64 {
        if self == other {
            return 1.0;
        }
        if self.package != other.package || self.is_crashed() != other.is_crashed() {
            return 0.0;
        }

        let a: HashSet<String> = self.signatures().into_iter().collect();
        let b: HashSet<String> = other.signatures().into_iter().collect();
        let union = a.union(&b).count();
        let elements = if union == 0 {
            1.0
        } else {
            a.intersection(&b).count() as f64 / union as f64
        };

        let (changed, _) = self.screenshot.delta(&other.screenshot);
        let cells = Screenshot::compared_cells() as f64;
        let pixels = 1.0 - (changed as f64 / cells).min(1.0);

        // Never report a perfect score for unequal states
        ((elements + pixels) / 2.0).min(0.999_999)
    }
}

impl PartialEq for UiState {
    fn eq(&self, other: &Self) -> bool {
        self.screenshot.digest == other.screenshot.digest
            && self.package == other.package
            && self.activity == other.activity
            && self.crash.is_some() == other.crash.is_some()
            && self.signatures() == other.signatures()
    }
}

/// Opaque reference to a device snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHandle(pub String);

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

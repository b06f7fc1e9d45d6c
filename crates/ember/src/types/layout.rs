use std::fmt;
use std::str::FromStr;

use crate::error::EmberError;

/// Semantic label of a single axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LayoutType {
    Batch,
    Channel,
    Depth,
    Height,
    Width,
    Time,
}

impl LayoutType {
    pub fn as_char(self) -> char {
        match self {
            LayoutType::Batch => 'N',
            LayoutType::Channel => 'C',
            LayoutType::Depth => 'D',
            LayoutType::Height => 'H',
            LayoutType::Width => 'W',
            LayoutType::Time => 'T',
        }
    }
}

/// Axis ordering used to interpret a shape positionally.
///
/// The batch ("major") axis is derived from the tag alone and never from the
/// shape it is paired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Layout {
    #[default]
    Undefined,
    NC,
    NCW,
    NWC,
    NCHW,
    NHWC,
    NCDHW,
    NDHWC,
    TNC,
    NTC,
}

impl Layout {
    /// Per-axis labels, empty for [`Layout::Undefined`].
    pub fn axes(self) -> &'static [LayoutType] {
        use LayoutType::*;
        match self {
            Layout::Undefined => &[],
            Layout::NC => &[Batch, Channel],
            Layout::NCW => &[Batch, Channel, Width],
            Layout::NWC => &[Batch, Width, Channel],
            Layout::NCHW => &[Batch, Channel, Height, Width],
            Layout::NHWC => &[Batch, Height, Width, Channel],
            Layout::NCDHW => &[Batch, Channel, Depth, Height, Width],
            Layout::NDHWC => &[Batch, Depth, Height, Width, Channel],
            Layout::TNC => &[Time, Batch, Channel],
            Layout::NTC => &[Batch, Time, Channel],
        }
    }

    /// Number of axes the layout describes, `None` when undefined.
    pub fn rank(self) -> Option<usize> {
        match self {
            Layout::Undefined => None,
            other => Some(other.axes().len()),
        }
    }

    /// Index of the batch axis, or `None` for an undefined layout.
    pub fn batch_axis(self) -> Option<usize> {
        self.axes().iter().position(|axis| *axis == LayoutType::Batch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layout::Undefined => "undefined",
            Layout::NC => "NC",
            Layout::NCW => "NCW",
            Layout::NWC => "NWC",
            Layout::NCHW => "NCHW",
            Layout::NHWC => "NHWC",
            Layout::NCDHW => "NCDHW",
            Layout::NDHWC => "NDHWC",
            Layout::TNC => "TNC",
            Layout::NTC => "NTC",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layout {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let layout = match s.to_ascii_uppercase().as_str() {
            "" | "UNDEFINED" => Layout::Undefined,
            "NC" => Layout::NC,
            "NCW" => Layout::NCW,
            "NWC" => Layout::NWC,
            "NCHW" => Layout::NCHW,
            "NHWC" => Layout::NHWC,
            "NCDHW" => Layout::NCDHW,
            "NDHWC" => Layout::NDHWC,
            "TNC" => Layout::TNC,
            "NTC" => Layout::NTC,
            _ => return Err(EmberError::parse("layout", s)),
        };
        Ok(layout)
    }
}

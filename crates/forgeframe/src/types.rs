//! Shared geometry and rendering context types.

use serde::{Deserialize, Serialize};

/// A width or height: numeric CSS pixels or a literal CSS length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    Px(f64),
    Css(String),
}

impl Dimension {
    /// Render as a CSS length, e.g. `500px` or `50%`.
    pub fn to_css(&self) -> String {
        match self {
            Dimension::Px(n) if n.fract() == 0.0 => format!("{}px", *n as i64),
            Dimension::Px(n) => format!("{}px", n),
            Dimension::Css(s) => s.clone(),
        }
    }
}

impl From<f64> for Dimension {
    fn from(n: f64) -> Self {
        Dimension::Px(n)
    }
}

impl From<i64> for Dimension {
    fn from(n: i64) -> Self {
        Dimension::Px(n as f64)
    }
}

impl From<i32> for Dimension {
    fn from(n: i32) -> Self {
        Dimension::Px(n as f64)
    }
}

impl From<&str> for Dimension {
    fn from(s: &str) -> Self {
        Dimension::Css(s.to_string())
    }
}

/// Partial dimensions; absent axes are left untouched when applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<Dimension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<Dimension>,
}

impl Dimensions {
    pub fn new(width: impl Into<Dimension>, height: impl Into<Dimension>) -> Self {
        Self {
            width: Some(width.into()),
            height: Some(height.into()),
        }
    }

    pub fn width(width: impl Into<Dimension>) -> Self {
        Self {
            width: Some(width.into()),
            height: None,
        }
    }

    pub fn height(height: impl Into<Dimension>) -> Self {
        Self {
            width: None,
            height: Some(height.into()),
        }
    }

    /// Overlay `other` on top of `self`, axis by axis.
    pub fn merged_with(&self, other: &Dimensions) -> Dimensions {
        Dimensions {
            width: other.width.clone().or_else(|| self.width.clone()),
            height: other.height.clone().or_else(|| self.height.clone()),
        }
    }
}

/// Where the component view lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderContext {
    #[default]
    Iframe,
    Popup,
}

impl RenderContext {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderContext::Iframe => "iframe",
            RenderContext::Popup => "popup",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dimension_css_rendering() {
        assert_eq!(Dimension::Px(500.0).to_css(), "500px");
        assert_eq!(Dimension::Px(10.5).to_css(), "10.5px");
        assert_eq!(Dimension::Css("50%".into()).to_css(), "50%");
    }

    #[test]
    fn dimensions_wire_shape() {
        let d = Dimensions::new(500, "80%");
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v, json!({"width": 500.0, "height": "80%"}));

        let partial: Dimensions = serde_json::from_value(json!({"height": 500})).unwrap();
        assert_eq!(partial.width, None);
        assert_eq!(partial.height, Some(Dimension::Px(500.0)));
    }

    #[test]
    fn merge_is_per_axis() {
        let base = Dimensions::new(300, 400);
        let merged = base.merged_with(&Dimensions::height(500));
        assert_eq!(merged.width, Some(Dimension::Px(300.0)));
        assert_eq!(merged.height, Some(Dimension::Px(500.0)));
    }
}

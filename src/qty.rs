// see [Definitions of the SI units: The binary prefixes](https://physics.nist.gov/cuu/Units/binary.html)
// see [Managing Compute Resources for Containers - Kubernetes](https://kubernetes.io/docs/concepts/configuration/manage-compute-resources-container/)
// see [apimachinery/quantity.go at master · kubernetes/apimachinery](https://github.com/kubernetes/apimachinery/blob/master/pkg/api/resource/quantity.go)

use std::str::FromStr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to parse scale in '{0}'")]
    ScaleParseError(String),

    #[error("Failed to read Qty (num) from '{input}'")]
    QtyNumberParseError {
        input: String,
        #[source] // optional if field name is `source`
        source: std::num::ParseFloatError,
    },

    #[error("Qty '{0}' is out of range")]
    QtyRangeError(String),
}

#[derive(Debug, Clone)]
pub struct Scale {
    label: &'static str,
    base: u32,
    pow: i32,
}

// should be sorted in DESC of base then ASC of pow (for adjust_scale)
static SCALES: [Scale; 14] = [
    Scale { label: "Ei", base: 2, pow: 6 },
    Scale { label: "Pi", base: 2, pow: 5 },
    Scale { label: "Ti", base: 2, pow: 4 },
    Scale { label: "Gi", base: 2, pow: 3 },
    Scale { label: "Mi", base: 2, pow: 2 },
    Scale { label: "Ki", base: 2, pow: 1 },
    Scale { label: "E", base: 10, pow: 6 },
    Scale { label: "P", base: 10, pow: 5 },
    Scale { label: "T", base: 10, pow: 4 },
    Scale { label: "G", base: 10, pow: 3 },
    Scale { label: "M", base: 10, pow: 2 },
    Scale { label: "k", base: 10, pow: 1 },
    Scale { label: "", base: 10, pow: 0 },
    Scale { label: "m", base: 10, pow: -1 },
];

static BYTES: Scale = Scale {
    label: "",
    base: 2,
    pow: 0,
};

impl Scale {
    fn factor(&self) -> f64 {
        let unit = if self.base == 2 { 1024f64 } else { 1000f64 };
        unit.powi(self.pow)
    }
}

impl Default for Scale {
    fn default() -> Self {
        Scale {
            label: "",
            base: 10,
            pow: 0,
        }
    }
}

impl FromStr for Scale {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SCALES
            .iter()
            .find(|v| v.label == s)
            .cloned()
            .ok_or_else(|| Error::ScaleParseError(s.to_owned()))
    }
}

/// A resource quantity, stored in milli-units of its base unit (cores or bytes).
///
/// The scale only remembers the family (decimal or binary) the quantity was
/// written in, so it can be displayed back in the same family.
#[derive(Debug, Clone)]
pub struct Qty {
    value: i64,
    scale: Scale,
}

impl Qty {
    /// CPU quantity, displayed in decimal units (`300m`, `1.5`)
    pub fn cores(cores: f64) -> Self {
        Self {
            value: (cores * 1000f64).round() as i64,
            scale: Scale::default(),
        }
    }

    /// Memory quantity, displayed in binary units (`300Mi`, `1.5Gi`)
    pub fn bytes(bytes: f64) -> Self {
        Self {
            value: (bytes * 1000f64).round() as i64,
            scale: BYTES.clone(),
        }
    }

    /// Pick the largest scale of the same family that keeps at least one unit.
    pub fn adjust_scale(&self) -> Qty {
        let abs = (self.value as f64 / 1000f64).abs();
        let plain_bytes = (self.scale.base == 2).then_some(&BYTES);
        let candidates = SCALES
            .iter()
            .filter(|s| s.base == self.scale.base)
            .chain(plain_bytes)
            .collect::<Vec<_>>();
        let scale = candidates
            .iter()
            .find(|s| abs >= s.factor())
            .or(candidates.last())
            .map(|s| (*s).clone())
            .unwrap_or_default();
        Qty {
            value: self.value,
            scale,
        }
    }
}

impl FromStr for Qty {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num_str, scale_str) = split_number(s.trim());
        let num = f64::from_str(num_str).map_err(|source| Error::QtyNumberParseError {
            input: s.to_owned(),
            source,
        })?;
        let scale = Scale::from_str(scale_str)?;
        // like apimachinery, fractions of the smallest unit are rounded up
        let milli = num * scale.factor() * 1000f64;
        let nearest = milli.round();
        let milli = if (milli - nearest).abs() < 1e-6 {
            nearest
        } else {
            milli.ceil()
        };
        // i64::MAX as f64 is 2^63, the first value a cast would saturate
        if !milli.is_finite() || milli.abs() >= i64::MAX as f64 {
            return Err(Error::QtyRangeError(s.to_owned()));
        }
        Ok(Qty {
            value: milli as i64,
            scale,
        })
    }
}

/// Split `1.5Gi` / `1e3` / `2E` into the numeric part and the scale label.
/// A trailing `e`/`E` is an exponent only when digits follow it, so `2E` stays exa.
fn split_number(s: &str) -> (&str, &str) {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len()
        && (bytes[end].is_ascii_digit() || matches!(bytes[end], b'.' | b'+' | b'-'))
    {
        end += 1;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digits_start {
            end = exp_end;
        }
    }
    s.split_at(end)
}

impl From<&Qty> for f64 {
    fn from(v: &Qty) -> f64 {
        v.value as f64 / 1000f64
    }
}

impl std::fmt::Display for Qty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scaled = self.value as f64 / (1000f64 * self.scale.factor());
        let txt = format!("{:.2}", scaled);
        let txt = txt.trim_end_matches('0').trim_end_matches('.');
        let txt = if txt == "-0" { "0" } else { txt };
        write!(f, "{}{}", txt, self.scale.label)
    }
}

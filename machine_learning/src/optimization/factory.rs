use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{self, Display},
    str::FromStr,
};

use super::{Adam, GradientDescent, Optimizer};

const DEFAULT_BETAS: (f32, f32) = (0.9, 0.999);
const DEFAULT_EPS: f32 = 1e-8;
const DEFAULT_ADAMW_WEIGHT_DECAY: f32 = 0.01;

/// The optimization algorithms that can be named in an optimizer string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

impl OptimizerKind {
    fn name(self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamw",
        }
    }

    /// The keys this kind accepts besides `type`.
    fn keys(self) -> &'static [&'static str] {
        match self {
            OptimizerKind::Sgd => &["lr", "momentum", "weight_decay"],
            OptimizerKind::Adam | OptimizerKind::AdamW => &["lr", "betas", "eps", "weight_decay"],
        }
    }
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for OptimizerKind {
    type Err = OptimizerErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            _ => Err(OptimizerErr::UnknownType(s.to_string())),
        }
    }
}

/// Everything that can go wrong while reading an optimizer string.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerErr {
    MissingType,
    UnknownType(String),
    UnrecognizedKey {
        kind: OptimizerKind,
        key: String,
    },
    MissingKey {
        kind: OptimizerKind,
        key: &'static str,
    },
    DuplicateKey(String),
    InvalidValue {
        key: String,
        value: String,
    },
    Malformed(String),
}

impl Display for OptimizerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerErr::MissingType => write!(f, "the optimizer string has no type"),
            OptimizerErr::UnknownType(kind) => write!(f, "unknown optimizer type {kind}"),
            OptimizerErr::UnrecognizedKey { kind, key } => {
                write!(f, "{kind} doesn't accept the {key} option")
            }
            OptimizerErr::MissingKey { kind, key } => write!(f, "{kind} requires the {key} option"),
            OptimizerErr::DuplicateKey(key) => write!(f, "the {key} option is given twice"),
            OptimizerErr::InvalidValue { key, value } => {
                write!(f, "invalid value {value} for the {key} option")
            }
            OptimizerErr::Malformed(item) => write!(f, "malformed optimizer option {item:?}"),
        }
    }
}

impl Error for OptimizerErr {}

/// A fully resolved optimizer description.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    pub momentum: f32,
}

impl OptimizerConfig {
    /// Parses a `key=value` list such as
    /// `type=adamw,lr=1e-4,weight_decay=0.1,betas=(0.9,0.95),eps=1e-8`.
    ///
    /// `type` and `lr` are mandatory, every other key falls back to the
    /// algorithm's default. Keys the algorithm doesn't know are errors.
    ///
    /// # Arguments
    /// * `spec` - The optimizer string.
    ///
    /// # Returns
    /// The resolved configuration or the first problem found in `spec`.
    pub fn parse(spec: &str) -> Result<Self, OptimizerErr> {
        let mut options = BTreeMap::new();

        for item in split_top_level(spec)? {
            let Some((key, value)) = item.split_once('=') else {
                return Err(OptimizerErr::Malformed(item.to_string()));
            };

            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(OptimizerErr::Malformed(item.to_string()));
            }

            if options.insert(key, value).is_some() {
                return Err(OptimizerErr::DuplicateKey(key.to_string()));
            }
        }

        let kind: OptimizerKind = options
            .remove("type")
            .ok_or(OptimizerErr::MissingType)?
            .parse()?;

        if let Some(key) = options.keys().find(|key| !kind.keys().iter().any(|k| k == *key)) {
            return Err(OptimizerErr::UnrecognizedKey {
                kind,
                key: key.to_string(),
            });
        }

        let float = |key: &'static str| -> Result<Option<f32>, OptimizerErr> {
            options.get(key).map(|value| parse_float(key, value)).transpose()
        };

        let lr = float("lr")?.ok_or(OptimizerErr::MissingKey { kind, key: "lr" })?;
        let default_weight_decay = match kind {
            OptimizerKind::AdamW => DEFAULT_ADAMW_WEIGHT_DECAY,
            _ => 0.,
        };

        let config = Self {
            kind,
            lr,
            betas: options
                .get("betas")
                .map(|value| parse_betas(value))
                .transpose()?
                .unwrap_or(DEFAULT_BETAS),
            eps: float("eps")?.unwrap_or(DEFAULT_EPS),
            weight_decay: float("weight_decay")?.unwrap_or(default_weight_decay),
            momentum: float("momentum")?.unwrap_or(0.),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), OptimizerErr> {
        let invalid = |key: &str, value: String| OptimizerErr::InvalidValue {
            key: key.to_string(),
            value,
        };

        if !(self.lr >= 0.) {
            return Err(invalid("lr", self.lr.to_string()));
        }

        let (b1, b2) = self.betas;
        if !(0. ..1.).contains(&b1) || !(0. ..1.).contains(&b2) {
            return Err(invalid("betas", format!("({b1},{b2})")));
        }

        if !(self.eps > 0.) {
            return Err(invalid("eps", self.eps.to_string()));
        }

        if !(self.weight_decay >= 0.) {
            return Err(invalid("weight_decay", self.weight_decay.to_string()));
        }

        if !(0. ..1.).contains(&self.momentum) {
            return Err(invalid("momentum", self.momentum.to_string()));
        }

        Ok(())
    }

    /// Builds the optimizer for `len` parameters.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer> {
        let Self {
            kind,
            lr,
            betas,
            eps,
            weight_decay,
            momentum,
        } = *self;

        match kind {
            OptimizerKind::Sgd => Box::new(GradientDescent::new(len, lr, momentum, weight_decay)),
            OptimizerKind::Adam => Box::new(Adam::new(len, lr, betas, eps, weight_decay)),
            OptimizerKind::AdamW => Box::new(Adam::decoupled(len, lr, betas, eps, weight_decay)),
        }
    }
}

impl FromStr for OptimizerConfig {
    type Err = OptimizerErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Splits on the commas that are not inside parentheses.
fn split_top_level(spec: &str) -> Result<Vec<&str>, OptimizerErr> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in spec.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| OptimizerErr::Malformed(spec.to_string()))?;
            }
            ',' if depth == 0 => {
                items.push(&spec[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(OptimizerErr::Malformed(spec.to_string()));
    }

    let last = &spec[start..];
    if !last.trim().is_empty() || !items.is_empty() {
        items.push(last);
    }

    Ok(items)
}

fn parse_float(key: &str, value: &str) -> Result<f32, OptimizerErr> {
    value
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| OptimizerErr::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_betas(value: &str) -> Result<(f32, f32), OptimizerErr> {
    let invalid = || OptimizerErr::InvalidValue {
        key: "betas".to_string(),
        value: value.to_string(),
    };

    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(invalid)?;

    match inner.split(',').map(str::trim).collect::<Vec<_>>().as_slice() {
        [b1, b2] => Ok((parse_float("betas", b1)?, parse_float("betas", b2)?)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_adamw_string() {
        let config =
            OptimizerConfig::parse("type=adamw,lr=1e-4,weight_decay=0.1,betas=(0.9,0.95),eps=1e-6")
                .unwrap();

        assert_eq!(
            config,
            OptimizerConfig {
                kind: OptimizerKind::AdamW,
                lr: 1e-4,
                betas: (0.9, 0.95),
                eps: 1e-6,
                weight_decay: 0.1,
                momentum: 0.,
            }
        );
    }

    #[test]
    fn defaults_fill_the_gaps() {
        let adamw: OptimizerConfig = "type=AdamW, lr=0.001".parse().unwrap();
        assert_eq!(adamw.betas, DEFAULT_BETAS);
        assert_eq!(adamw.eps, DEFAULT_EPS);
        assert_eq!(adamw.weight_decay, DEFAULT_ADAMW_WEIGHT_DECAY);

        let adam: OptimizerConfig = "type=adam,lr=0.001".parse().unwrap();
        assert_eq!(adam.weight_decay, 0.);

        let sgd: OptimizerConfig = "type=sgd,lr=0.1,momentum=0.9".parse().unwrap();
        assert_eq!(sgd.momentum, 0.9);
    }

    #[test]
    fn lr_is_mandatory() {
        assert_eq!(
            OptimizerConfig::parse("type=sgd,momentum=0.9"),
            Err(OptimizerErr::MissingKey {
                kind: OptimizerKind::Sgd,
                key: "lr"
            })
        );
    }

    #[test]
    fn type_is_mandatory() {
        assert_eq!(
            OptimizerConfig::parse("lr=0.1"),
            Err(OptimizerErr::MissingType)
        );
        assert_eq!(OptimizerConfig::parse(""), Err(OptimizerErr::MissingType));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            OptimizerConfig::parse("type=lion,lr=0.1"),
            Err(OptimizerErr::UnknownType("lion".to_string()))
        );
    }

    #[test]
    fn keys_of_other_algorithms_are_rejected() {
        assert_eq!(
            OptimizerConfig::parse("type=adam,lr=0.1,momentum=0.9"),
            Err(OptimizerErr::UnrecognizedKey {
                kind: OptimizerKind::Adam,
                key: "momentum".to_string()
            })
        );
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!(matches!(
            OptimizerConfig::parse("type=adam,lr"),
            Err(OptimizerErr::Malformed(_))
        ));
        assert!(matches!(
            OptimizerConfig::parse("type=adam,lr=0.1,betas=(0.9,0.95"),
            Err(OptimizerErr::Malformed(_))
        ));
        assert!(matches!(
            OptimizerConfig::parse("type=adam,lr=0.1,betas=(0.9)"),
            Err(OptimizerErr::InvalidValue { .. })
        ));
        assert!(matches!(
            OptimizerConfig::parse("type=adam,lr=fast"),
            Err(OptimizerErr::InvalidValue { .. })
        ));
        assert_eq!(
            OptimizerConfig::parse("type=adam,lr=0.1,lr=0.2"),
            Err(OptimizerErr::DuplicateKey("lr".to_string()))
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(OptimizerConfig::parse("type=adam,lr=-1").is_err());
        assert!(OptimizerConfig::parse("type=adam,lr=0.1,betas=(1.0,0.9)").is_err());
        assert!(OptimizerConfig::parse("type=adam,lr=0.1,eps=0").is_err());
    }

    #[test]
    fn built_optimizer_starts_at_the_configured_rate() {
        let optimizer = OptimizerConfig::parse("type=adamw,lr=0.5").unwrap().build(4);

        assert_eq!(optimizer.learning_rate(), 0.5);
        assert_eq!(optimizer.steps(), 0);
    }
}

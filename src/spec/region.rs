//! Region identifiers accepted by a topology.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! regions {
    ($($variant:ident => $id:literal),+ $(,)?) => {
        /// A commercial AWS region.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Region {
            $(
                #[serde(rename = $id)]
                $variant,
            )+
        }

        impl Region {
            /// Every known region, in identifier order.
            pub const ALL: &'static [Region] = &[$(Region::$variant),+];

            /// The region identifier, e.g. `eu-west-3`.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Region::$variant => $id,)+
                }
            }
        }

        impl FromStr for Region {
            type Err = UnknownRegion;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($id => Ok(Region::$variant),)+
                    other => Err(UnknownRegion(other.to_string())),
                }
            }
        }
    };
}

regions! {
    AfSouth1 => "af-south-1",
    ApEast1 => "ap-east-1",
    ApNortheast1 => "ap-northeast-1",
    ApNortheast2 => "ap-northeast-2",
    ApNortheast3 => "ap-northeast-3",
    ApSouth1 => "ap-south-1",
    ApSouth2 => "ap-south-2",
    ApSoutheast1 => "ap-southeast-1",
    ApSoutheast2 => "ap-southeast-2",
    ApSoutheast3 => "ap-southeast-3",
    ApSoutheast4 => "ap-southeast-4",
    CaCentral1 => "ca-central-1",
    EuCentral1 => "eu-central-1",
    EuCentral2 => "eu-central-2",
    EuNorth1 => "eu-north-1",
    EuSouth1 => "eu-south-1",
    EuSouth2 => "eu-south-2",
    EuWest1 => "eu-west-1",
    EuWest2 => "eu-west-2",
    EuWest3 => "eu-west-3",
    IlCentral1 => "il-central-1",
    MeCentral1 => "me-central-1",
    MeSouth1 => "me-south-1",
    SaEast1 => "sa-east-1",
    UsEast1 => "us-east-1",
    UsEast2 => "us-east-2",
    UsWest1 => "us-west-1",
    UsWest2 => "us-west-2",
}

/// Returned when parsing an identifier that is not in the region list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown region: {0}")]
pub struct UnknownRegion(pub String);

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_every_region() {
        for region in Region::ALL {
            assert_eq!(region.as_str().parse::<Region>(), Ok(*region));
        }
        assert_eq!(Region::ALL.len(), 28);
    }

    #[test]
    fn test_unknown_region() {
        assert!("EU-WEST-3".parse::<Region>().is_err());
        assert!("cn-north-1".parse::<Region>().is_err());
    }

    #[test]
    fn test_serde_uses_identifier() {
        let json = serde_json::to_string(&Region::UsEast1).unwrap();
        assert_eq!(json, "\"us-east-1\"");
        let parsed: Region = serde_json::from_str("\"ap-southeast-4\"").unwrap();
        assert_eq!(parsed, Region::ApSoutheast4);
    }
}

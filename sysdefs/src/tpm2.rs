use anyhow::{bail, Error};
use enumflags2::bitflags;
use serde::{self, Deserialize, Serialize};

/// Platform Configuration Registers relevant to boot-time unlock policies.
///
/// Only the registers the agent can sensibly bind a LUKS keyslot to are
/// listed; the numeric values match the TPM 2.0 PCR indices.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pcr {
    /// PCR 0, or `platform-code`.
    Pcr0 = 1 << 0,
    /// PCR 4, or `boot-loader-code`.
    Pcr4 = 1 << 4,
    /// PCR 7, or `secure-boot-policy`.
    Pcr7 = 1 << 7,
    /// PCR 11, or `kernel-boot`.
    Pcr11 = 1 << 11,
    /// PCR 14, or `shim-policy`.
    Pcr14 = 1 << 14,
}

impl Pcr {
    /// Returns the digit representation of the PCR number.
    pub fn to_num(&self) -> u32 {
        (*self as u32).trailing_zeros()
    }

    /// Returns the PCR for the given digit number. Needed for deserialization.
    pub fn from_num(num: u32) -> Result<Self, Error> {
        match num {
            0 => Ok(Pcr::Pcr0),
            4 => Ok(Pcr::Pcr4),
            7 => Ok(Pcr::Pcr7),
            11 => Ok(Pcr::Pcr11),
            14 => Ok(Pcr::Pcr14),
            _ => bail!("PCR {num} cannot be used for unlock policies"),
        }
    }
}

impl Serialize for Pcr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.to_num())
    }
}

impl<'de> Deserialize<'de> for Pcr {
    fn deserialize<D>(deserializer: D) -> Result<Pcr, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let num = u32::deserialize(deserializer)?;
        Pcr::from_num(num).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_num() {
        assert_eq!(Pcr::Pcr0.to_num(), 0);
        assert_eq!(Pcr::Pcr4.to_num(), 4);
        assert_eq!(Pcr::Pcr7.to_num(), 7);
        assert_eq!(Pcr::Pcr11.to_num(), 11);
        assert_eq!(Pcr::Pcr14.to_num(), 14);
    }

    #[test]
    fn test_from_num() {
        assert_eq!(Pcr::from_num(7).unwrap(), Pcr::Pcr7);
        assert_eq!(Pcr::from_num(11).unwrap(), Pcr::Pcr11);
        assert_eq!(
            Pcr::from_num(3).unwrap_err().to_string(),
            "PCR 3 cannot be used for unlock policies"
        );
    }

    #[test]
    fn test_serde() {
        let pcrs: Vec<Pcr> = serde_json::from_str("[7, 11]").unwrap();
        assert_eq!(pcrs, vec![Pcr::Pcr7, Pcr::Pcr11]);
        assert_eq!(serde_json::to_string(&pcrs).unwrap(), "[7,11]");
        serde_json::from_str::<Pcr>("5").unwrap_err();
    }
}

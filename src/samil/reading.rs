use crate::prelude::*;
use crate::error::Error;

use {
    nom::{combinator::map, error::ParseError, number::complete::be_u16, IResult},
    nom_derive::{Nom, Parse},
    num_enum::FromPrimitive,
    serde::Serialize,
    serde_with::{serde_as, DisplayFromStr},
    std::fmt,
};

/// Bytes of a values payload that carry known fields.
pub const VALUES_PAYLOAD_LEN: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum OperatingMode {
    Wait = 0,
    Normal = 1,
    PvPowerOff = 5,
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl OperatingMode {
    pub fn parse_code<'a, E: ParseError<&'a [u8]>>(
        input: &'a [u8],
    ) -> IResult<&'a [u8], Self, E> {
        map(be_u16, Self::from)(input)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Wait => write!(f, "wait"),
            OperatingMode::Normal => write!(f, "normal"),
            OperatingMode::PvPowerOff => write!(f, "pv_power_off"),
            OperatingMode::Unknown(code) => write!(f, "{}", code),
        }
    }
}

// Reading {{{
/// Current values of one inverter, decoded from a values response.
///
/// Fields follow the payload order; gaps are bytes the protocol does not
/// document yet.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(BigEndian)]
pub struct Reading {
    #[nom(Parse = "Utils::be_u16_div10")]
    pub ambient_temp: f64, // °C
    #[nom(Parse = "Utils::be_u16_div10")]
    pub pv1_voltage: f64, // V
    #[nom(Parse = "Utils::be_u16_div10")]
    pub pv2_voltage: f64, // V
    #[nom(Parse = "Utils::be_u16_div10")]
    pub pv1_current: f64, // A
    #[nom(Parse = "Utils::be_u16_div10")]
    pub pv2_current: f64, // A

    #[nom(SkipBefore(4))]
    #[nom(Parse = "Utils::be_u16_div10")]
    pub inverter_temp: f64, // °C

    #[nom(SkipBefore(2))]
    #[nom(Parse = "Utils::be_u16_div10")]
    pub grid_voltage: f64, // V
    #[nom(Parse = "Utils::be_u16_div100")]
    pub grid_frequency: f64, // Hz
    #[nom(Parse = "Utils::be_u16_div10")]
    pub grid_current: f64, // A

    #[nom(SkipBefore(10))]
    #[nom(Parse = "Utils::be_u32_div10")]
    pub energy_total: f64, // kWh
    pub total_operation_hours: u32, // h
    #[nom(Parse = "Utils::be_u16_div100")]
    pub energy_today: f64, // kWh
    pub output_power: u32, // W

    #[nom(Parse = "OperatingMode::parse_code")]
    #[serde_as(as = "DisplayFromStr")]
    pub operating_mode: OperatingMode,
}

/// Decodes the payload of a values response.
pub fn interpret(payload: &[u8]) -> Result<Reading, Error> {
    match Reading::parse(payload) {
        Ok((_, reading)) => Ok(reading),
        Err(_) => Err(Error::MalformedFrame(format!(
            "values payload of {} bytes, expected at least {}",
            payload.len(),
            VALUES_PAYLOAD_LEN
        ))),
    }
}

impl Reading {
    /// Sanity checks for values a healthy inverter never reports.
    pub fn validate(&self) -> Result<()> {
        if self.output_power > 0 && !(45.0..=65.0).contains(&self.grid_frequency) {
            bail!("Invalid grid frequency: {}", self.grid_frequency);
        }
        if self.grid_voltage > 500.0 {
            bail!("Invalid grid voltage: {}", self.grid_voltage);
        }
        if self.pv1_voltage > 1000.0 || self.pv2_voltage > 1000.0 {
            return Err(anyhow!(
                "Invalid PV voltages: {} / {}",
                self.pv1_voltage,
                self.pv2_voltage
            ));
        }
        if self.ambient_temp > 100.0 || self.inverter_temp > 150.0 {
            return Err(anyhow!(
                "Invalid temperatures: ambient {} inverter {}",
                self.ambient_temp,
                self.inverter_temp
            ));
        }

        Ok(())
    }

    /// Combines the readings of several inverters on one site. Energy, power
    /// and currents add up; voltages, temperatures and frequency are averaged.
    /// The operating mode and hours are those of the first inverter.
    pub fn aggregate(readings: &[Reading]) -> Option<Reading> {
        let (first, _) = readings.split_first()?;
        let n = readings.len() as f64;
        let sum = |f: fn(&Reading) -> f64| readings.iter().map(f).sum::<f64>();
        let avg = |f: fn(&Reading) -> f64| Utils::round(sum(f) / n, 2);

        Some(Reading {
            ambient_temp: avg(|r| r.ambient_temp),
            pv1_voltage: avg(|r| r.pv1_voltage),
            pv2_voltage: avg(|r| r.pv2_voltage),
            pv1_current: Utils::round(sum(|r| r.pv1_current), 1),
            pv2_current: Utils::round(sum(|r| r.pv2_current), 1),
            inverter_temp: avg(|r| r.inverter_temp),
            grid_voltage: avg(|r| r.grid_voltage),
            grid_frequency: avg(|r| r.grid_frequency),
            grid_current: Utils::round(sum(|r| r.grid_current), 1),
            energy_total: Utils::round(sum(|r| r.energy_total), 1),
            total_operation_hours: first.total_operation_hours,
            energy_today: Utils::round(sum(|r| r.energy_today), 2),
            output_power: readings.iter().map(|r| r.output_power).sum(),
            operating_mode: first.operating_mode,
        })
    }
} // }}}

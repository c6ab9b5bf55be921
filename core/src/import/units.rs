//! Parsers for the "value unit" attribute strings found in divelog XML,
//! e.g. `30.2 m`, `27.0 C`, `200.0 bar`, `32.0%` or `45:30 min`.

use nom::{
    bytes::complete::take_while1,
    character::complete::{char, digit1, space0},
    combinator::{all_consuming, map_res, opt},
    number::complete::double,
    sequence::preceded,
    IResult, Parser,
};

use crate::models::{DepthUnit, PressureUnit, TemperatureUnit};

const LITERS_PER_CUFT: f64 = 28.316_846_6;

fn unit(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace()).parse(input)
}

fn quantity_parser(input: &str) -> IResult<&str, (f64, Option<&str>)> {
    (
        preceded(space0, double),
        opt(preceded(space0, unit)),
    )
        .parse(input)
}

/// Splits `raw` into its numeric value and optional unit suffix.
pub fn quantity(raw: &str) -> Result<(f64, Option<&str>), String> {
    let trimmed = raw.trim();
    all_consuming(quantity_parser)
        .parse(trimmed)
        .map(|(_, parsed)| parsed)
        .map_err(|_| format!("'{raw}' is not a number with an optional unit"))
}

pub fn depth(raw: &str) -> Result<(f64, DepthUnit), String> {
    match quantity(raw)? {
        (value, None | Some("m")) => Ok((value, DepthUnit::Meters)),
        (value, Some("ft")) => Ok((value, DepthUnit::Feet)),
        (_, Some(other)) => Err(format!("unknown depth unit '{other}'")),
    }
}

pub fn temperature(raw: &str) -> Result<(f64, TemperatureUnit), String> {
    match quantity(raw)? {
        (value, None | Some("C" | "°C")) => Ok((value, TemperatureUnit::Celsius)),
        (value, Some("F" | "°F")) => Ok((value, TemperatureUnit::Fahrenheit)),
        (_, Some(other)) => Err(format!("unknown temperature unit '{other}'")),
    }
}

pub fn pressure(raw: &str) -> Result<(f64, PressureUnit), String> {
    match quantity(raw)? {
        (value, None | Some("bar")) => Ok((value, PressureUnit::Bar)),
        (value, Some("psi")) => Ok((value, PressureUnit::Psi)),
        (_, Some(other)) => Err(format!("unknown pressure unit '{other}'")),
    }
}

/// Tank volume in liters.
pub fn volume(raw: &str) -> Result<f64, String> {
    match quantity(raw)? {
        (value, None | Some("l")) => Ok(value),
        (value, Some("cuft")) => Ok(value * LITERS_PER_CUFT),
        (_, Some(other)) => Err(format!("unknown volume unit '{other}'")),
    }
}

pub fn percent(raw: &str) -> Result<f64, String> {
    match quantity(raw)? {
        (value, None | Some("%")) => Ok(value),
        (_, Some(other)) => Err(format!("unknown percentage '{other}'")),
    }
}

fn clock_parser(input: &str) -> IResult<&str, (u32, Option<u32>)> {
    (
        preceded(space0, map_res(digit1, str::parse::<u32>)),
        opt(preceded(char(':'), map_res(digit1, str::parse::<u32>))),
    )
        .parse(input)
}

/// `45:30 min` or `45 min` into fractional minutes.
pub fn duration_minutes(raw: &str) -> Result<f64, String> {
    let invalid = || format!("'{raw}' is not a duration");
    let (rest, (minutes, seconds)) = clock_parser(raw.trim()).map_err(|_| invalid())?;
    match rest.trim() {
        "" | "min" => {}
        _ => return Err(invalid()),
    }
    let seconds = seconds.unwrap_or(0);
    if seconds >= 60 {
        return Err(invalid());
    }
    Ok(f64::from(minutes) + f64::from(seconds) / 60.0)
}

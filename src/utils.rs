use nom::{
    error::ParseError,
    number::complete::{be_u16, be_u32},
    IResult,
};

pub struct Utils;

impl Utils {
    pub fn be_u16_div10<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], f64, E> {
        let (input, num) = be_u16(input)?;
        Ok((input, num as f64 / 10.0))
    }

    pub fn be_u16_div100<'a, E: ParseError<&'a [u8]>>(
        input: &'a [u8],
    ) -> IResult<&'a [u8], f64, E> {
        let (input, num) = be_u16(input)?;
        Ok((input, num as f64 / 100.0))
    }

    pub fn be_u32_div10<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], f64, E> {
        let (input, num) = be_u32(input)?;
        Ok((input, num as f64 / 10.0))
    }

    // 16-bit wrapping sum of every byte, which is what the inverter puts in
    // the last two bytes of a frame.
    pub fn checksum(data: &[u8]) -> u16 {
        data.iter()
            .fold(0u16, |sum, byte| sum.wrapping_add(u16::from(*byte)))
    }

    pub fn round(x: f64, decimals: u32) -> f64 {
        let y = 10i32.pow(decimals) as f64;
        (x * y).round() / y
    }

    pub fn hex(data: &[u8]) -> String {
        data.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div10_reads_big_endian() {
        let (rest, v) = Utils::be_u16_div10::<nom::error::Error<&[u8]>>(&[0x00, 0xc8, 0xff]).unwrap();
        assert_eq!(v, 20.0);
        assert_eq!(rest, &[0xff]);
    }

    #[test]
    fn div10_needs_two_bytes() {
        assert!(Utils::be_u16_div10::<nom::error::Error<&[u8]>>(&[0x01]).is_err());
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(Utils::checksum(&[0x55, 0xaa, 0x0c, 0x01, 0x07]), 0x0113);
        assert_eq!(Utils::checksum(&[0xff; 258]), (0xffu32 * 258 % 0x10000) as u16);
    }

    #[test]
    fn round_to_places() {
        assert_eq!(Utils::round(1.2345, 2), 1.23);
        assert_eq!(Utils::round(230.06, 1), 230.1);
    }

    #[test]
    fn hex_formats_bytes() {
        assert_eq!(Utils::hex(&[0x55, 0xaa, 0x00]), "55 aa 00");
    }
}

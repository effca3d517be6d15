//! CHDO/SFDU envelope access.
//!
//! An SFDU is a 20-byte label followed by a chain of CHDOs, each a 16-bit
//! type and 16-bit length followed by that many body bytes. Aggregation
//! CHDOs wrap the CHDOs that follow them, so only their 4-byte header is
//! consumed. Which fields live where is mission configuration, supplied as
//! a [ChdoFieldTable] rather than parsed from the station dictionary here.
use hifitime::Epoch;
use serde::{Deserialize, Serialize};

use crate::bits;
use crate::time::{epoch_from_ccsds_millis, Sclk};
use crate::{Error, Result};

/// Length of the SFDU label.
pub const SFDU_LABEL_LEN: usize = 20;

/// Control authority marker of a JPL SFDU label.
pub const SFDU_MARKER: &[u8] = b"NJPL";

/// CHDO type of the DSN monitor channelized data area.
pub const CHANNELIZED_DATA_AREA_CHDO: u16 = 28;

const CHDO_HEADER_LEN: usize = 4;

/// How a CHDO field's bits are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChdoFieldFormat {
    Unsigned,
    Signed,
    Float,
    Ascii,
    /// Unsigned milliseconds past the 1958 CCSDS epoch.
    Time,
    /// 32-bit coarse count followed by `bit_length - 32` fine bits.
    Sclk,
}

/// Location and format of one named CHDO field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChdoFieldDefinition {
    pub name: String,
    pub chdo_type: u16,
    pub byte_offset: usize,
    #[serde(default)]
    pub bit_offset: usize,
    pub bit_length: usize,
    pub format: ChdoFieldFormat,
}

/// The self-describing field table for a mission's CHDO set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChdoFieldTable {
    #[serde(default)]
    pub fields: Vec<ChdoFieldDefinition>,
    /// CHDO types whose length covers the CHDOs that follow them.
    #[serde(default)]
    pub aggregation_types: Vec<u16>,
    /// CHDO types classified as data CHDOs.
    #[serde(default)]
    pub data_types: Vec<u16>,
}

impl ChdoFieldTable {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&ChdoFieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn is_aggregation(&self, chdo_type: u16) -> bool {
        self.aggregation_types.contains(&chdo_type)
    }

    #[must_use]
    pub fn is_data(&self, chdo_type: u16) -> bool {
        self.data_types.contains(&chdo_type)
    }
}

/// One CHDO: type plus body bytes (header excluded).
#[derive(Debug, Clone)]
pub struct Chdo {
    pub chdo_type: u16,
    body: Vec<u8>,
}

impl Chdo {
    /// Body bytes, without the 4-byte CHDO header.
    #[must_use]
    pub fn bytes_without_header(&self) -> &[u8] {
        &self.body
    }
}

/// A parsed SFDU envelope with typed field access.
#[derive(Debug, Clone)]
pub struct ChdoSfdu {
    table: ChdoFieldTable,
    label: String,
    chdos: Vec<Chdo>,
}

impl ChdoSfdu {
    /// Parse one SFDU from `data`.
    ///
    /// # Errors
    /// [Error::Envelope] when the label is missing/foreign or a CHDO
    /// declares a length past the end of the buffer.
    pub fn parse(table: ChdoFieldTable, data: &[u8]) -> Result<Self> {
        if data.len() < SFDU_LABEL_LEN {
            return Err(Error::Envelope(format!(
                "buffer of {} bytes cannot hold an SFDU label",
                data.len()
            )));
        }
        if !data.starts_with(SFDU_MARKER) {
            return Err(Error::Envelope(
                "buffer does not start with an NJPL SFDU label".into(),
            ));
        }
        let label = String::from_utf8_lossy(&data[..SFDU_LABEL_LEN]).into_owned();

        let mut chdos = Vec::new();
        let mut offset = SFDU_LABEL_LEN;
        while offset + CHDO_HEADER_LEN <= data.len() {
            let chdo_type = bits::extract_u64(data, offset, 0, 16)? as u16;
            let length = bits::extract_u64(data, offset + 2, 0, 16)? as usize;

            // Aggregation CHDO lengths cover the CHDOs that follow; only
            // their header is consumed here.
            let body_len = if table.is_aggregation(chdo_type) {
                0
            } else {
                length
            };
            let body_end = offset + CHDO_HEADER_LEN + body_len;
            if body_end > data.len() {
                return Err(Error::Envelope(format!(
                    "CHDO type {chdo_type} declares {length} body bytes but only {} remain",
                    data.len() - offset - CHDO_HEADER_LEN
                )));
            }
            chdos.push(Chdo {
                chdo_type,
                body: data[offset + CHDO_HEADER_LEN..body_end].to_vec(),
            });
            offset = body_end;
        }

        Ok(ChdoSfdu {
            table,
            label,
            chdos,
        })
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn chdo(&self, chdo_type: u16) -> Option<&Chdo> {
        self.chdos.iter().find(|c| c.chdo_type == chdo_type)
    }

    /// The first CHDO classified as a data CHDO by the field table.
    #[must_use]
    pub fn data_chdo(&self) -> Option<&Chdo> {
        self.chdos.iter().find(|c| self.table.is_data(c.chdo_type))
    }

    fn locate(&self, name: &str) -> Option<(&ChdoFieldDefinition, &Chdo)> {
        let def = self.table.field(name)?;
        let chdo = self.chdo(def.chdo_type)?;
        Some((def, chdo))
    }

    /// `Ok(None)` when the field or its CHDO is absent from this envelope;
    /// `Err` when the field is present but its bits cannot be extracted.
    pub fn field_as_unsigned(&self, name: &str) -> Result<Option<u64>> {
        let Some((def, chdo)) = self.locate(name) else {
            return Ok(None);
        };
        bits::extract_u64(&chdo.body, def.byte_offset, def.bit_offset, def.bit_length)
            .map(Some)
            .map_err(|e| malformed(name, &e))
    }

    pub fn field_as_signed(&self, name: &str) -> Result<Option<i64>> {
        let Some((def, chdo)) = self.locate(name) else {
            return Ok(None);
        };
        bits::extract_i64(&chdo.body, def.byte_offset, def.bit_offset, def.bit_length)
            .map(Some)
            .map_err(|e| malformed(name, &e))
    }

    pub fn field_as_float(&self, name: &str) -> Result<Option<f64>> {
        let Some((def, chdo)) = self.locate(name) else {
            return Ok(None);
        };
        bits::extract_f64(&chdo.body, def.byte_offset, def.bit_offset, def.bit_length)
            .map(Some)
            .map_err(|e| malformed(name, &e))
    }

    pub fn field_as_ascii(&self, name: &str) -> Result<Option<String>> {
        let Some((def, chdo)) = self.locate(name) else {
            return Ok(None);
        };
        bits::extract_ascii(&chdo.body, def.byte_offset, def.bit_length / 8)
            .map(Some)
            .map_err(|e| malformed(name, &e))
    }

    pub fn field_as_epoch(&self, name: &str) -> Result<Option<Epoch>> {
        Ok(self.field_as_unsigned(name)?.map(epoch_from_ccsds_millis))
    }

    pub fn field_as_sclk(&self, name: &str) -> Result<Option<Sclk>> {
        let Some((def, chdo)) = self.locate(name) else {
            return Ok(None);
        };
        if def.bit_length < 32 {
            return Err(Error::Envelope(format!(
                "sclk field {name} must be at least 32 bits"
            )));
        }
        let fine_bits = def.bit_length - 32;
        let coarse = bits::extract_u64(&chdo.body, def.byte_offset, def.bit_offset, 32)
            .map_err(|e| malformed(name, &e))?;
        let fine = if fine_bits == 0 {
            0
        } else {
            bits::extract_u64(
                &chdo.body,
                def.byte_offset,
                def.bit_offset + 32,
                fine_bits,
            )
            .map_err(|e| malformed(name, &e))? as u32
        };
        Ok(Some(Sclk::new(coarse, fine)))
    }
}

fn malformed(name: &str, err: &Error) -> Error {
    Error::Envelope(format!("field {name} cannot be extracted: {err}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a MON-0158-like field table used across the crate's tests.
    pub(crate) fn test_field_table() -> ChdoFieldTable {
        ChdoFieldTable {
            fields: vec![
                ChdoFieldDefinition {
                    name: "scft_id".into(),
                    chdo_type: 2,
                    byte_offset: 0,
                    bit_offset: 0,
                    bit_length: 16,
                    format: ChdoFieldFormat::Unsigned,
                },
                ChdoFieldDefinition {
                    name: "data_source".into(),
                    chdo_type: 2,
                    byte_offset: 2,
                    bit_offset: 0,
                    bit_length: 16,
                    format: ChdoFieldFormat::Unsigned,
                },
                ChdoFieldDefinition {
                    name: "number_channels".into(),
                    chdo_type: 27,
                    byte_offset: 0,
                    bit_offset: 0,
                    bit_length: 16,
                    format: ChdoFieldFormat::Unsigned,
                },
                ChdoFieldDefinition {
                    name: "mst".into(),
                    chdo_type: 27,
                    byte_offset: 2,
                    bit_offset: 0,
                    bit_length: 48,
                    format: ChdoFieldFormat::Time,
                },
            ],
            aggregation_types: vec![1],
            data_types: vec![CHANNELIZED_DATA_AREA_CHDO],
        }
    }

    /// Assemble an SFDU: label + aggregation chdo 1 + chdo 2 (scid,
    /// station) + chdo 27 (count, mst) + data chdo 28 with `body`.
    pub(crate) fn build_sfdu(scid: u16, station: u16, count: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"NJPL2I00xxxx0001    ");
        assert_eq!(out.len(), SFDU_LABEL_LEN);

        // aggregation chdo: length covers the rest but no body bytes here
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());

        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&scid.to_be_bytes());
        out.extend_from_slice(&station.to_be_bytes());

        out.extend_from_slice(&27u16.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 0x03, 0xe8]); // mst: 1000 ms

        out.extend_from_slice(&CHANNELIZED_DATA_AREA_CHDO.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn parses_chdo_chain() {
        let data = build_sfdu(76, 14, 2, &[0xde, 0xad]);
        let sfdu = ChdoSfdu::parse(test_field_table(), &data).unwrap();

        assert!(sfdu.label().starts_with("NJPL"));
        assert_eq!(sfdu.field_as_unsigned("scft_id").unwrap(), Some(76));
        assert_eq!(sfdu.field_as_unsigned("data_source").unwrap(), Some(14));
        assert_eq!(sfdu.field_as_unsigned("number_channels").unwrap(), Some(2));
        assert_eq!(
            sfdu.field_as_epoch("mst").unwrap(),
            Some(epoch_from_ccsds_millis(1000))
        );
        assert_eq!(
            sfdu.data_chdo().unwrap().bytes_without_header(),
            &[0xde, 0xad]
        );
    }

    #[test]
    fn missing_field_is_none_not_error() {
        let data = build_sfdu(76, 14, 0, &[]);
        let sfdu = ChdoSfdu::parse(test_field_table(), &data).unwrap();
        assert_eq!(sfdu.field_as_unsigned("vcid").unwrap(), None);
    }

    #[test]
    fn truncated_chdo_is_an_envelope_error() {
        let mut data = build_sfdu(76, 14, 0, &[1, 2, 3, 4]);
        data.truncate(data.len() - 2);
        assert!(matches!(
            ChdoSfdu::parse(test_field_table(), &data),
            Err(Error::Envelope(_))
        ));
    }

    #[test]
    fn foreign_label_rejected() {
        let data = vec![0u8; 64];
        assert!(ChdoSfdu::parse(test_field_table(), &data).is_err());
    }
}

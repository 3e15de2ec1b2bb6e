//! Reader for the VBus Specification File (VSF) format.
//!
//! A VSF is a little-endian binary descriptor containing a string table,
//! localized texts, units, device templates and packet templates. Packet
//! templates describe how to decode the payload of a matched v1.0 packet
//! into named numeric fields; see [`VbusSpec::packet`] and
//! [`PacketTemplate::decode`].

use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use crate::value::Value;

/// Set of errors that can occur while loading or applying a VSF.
#[derive(Debug, thiserror::Error)]
pub enum VsfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The two header checksums disagree; the file is corrupt.
    #[error("header checksums do not match: {a:#06X} != {b:#06X}")]
    Checksum { a: u16, b: u16 },

    /// Only data version 1 exists.
    #[error("unsupported data version: {0}")]
    Version(i32),

    /// A record points at a text, localized text or unit that is not in
    /// its table.
    #[error("dangling {table} reference: index {index} not in 0..{count}")]
    DanglingRef {
        table: &'static str,
        index: i64,
        count: usize,
    },

    /// A string in the text block is not valid UTF-8.
    #[error("text at offset {offset:#X} is not valid UTF-8")]
    BadText { offset: u64 },

    /// A payload is shorter than a field part requires.
    #[error("payload of {len} byte(s) too short for field part at offset {offset}")]
    ShortPayload { offset: usize, len: usize },
}

/// Language of a localized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    En,
    De,
    Fr,
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Language, String> {
        match s.to_ascii_uppercase().as_str() {
            "EN" => Ok(Language::En),
            "DE" => Ok(Language::De),
            "FR" => Ok(Language::Fr),
            other => Err(format!("unknown language '{}'", other)),
        }
    }
}

/// A text in the three supported languages, as indices into the text
/// table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizedText {
    pub en: i32,
    pub de: i32,
    pub fr: i32,
}

impl LocalizedText {
    const DATA_LEN: i64 = 4 * 3;

    fn index(&self, lang: Language) -> i32 {
        match lang {
            Language::En => self.en,
            Language::De => self.de,
            Language::Fr => self.fr,
        }
    }
}

/// A physical unit, e.g. `°C` with family "temperature".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: i32,
    pub family_id: i32,
    pub code_index: i32,
    pub text_index: i32,
}

impl Unit {
    const DATA_LEN: i64 = 4 * 4;
}

/// Maps a bus address (masked) to a localized device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTemplate {
    pub self_addr: u16,
    pub self_mask: u16,
    pub peer_addr: u16,
    pub peer_mask: u16,
    pub name_index: i32,
}

impl DeviceTemplate {
    const DATA_LEN: i64 = 2 * 4 + 4;
}

/// Describes the payload of packets matching an address/command pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketTemplate {
    pub dst_addr: u16,
    pub dst_mask: u16,
    pub src_addr: u16,
    pub src_mask: u16,
    pub command: u16,
    pub fields: Vec<PacketField>,
}

impl PacketTemplate {
    const DATA_LEN: i64 = 2 * 6 + 8;

    /// Stable identifier: `00_<dst>_<src>_10_<command>`.
    pub fn packet_id(&self) -> String {
        format!(
            "00_{:04X}_{:04X}_10_{:04X}",
            self.dst_addr, self.src_addr, self.command
        )
    }

    /// Decodes a payload into `(field, value)` pairs in template order.
    pub fn decode<'a>(&'a self, payload: &[u8]) -> Result<Vec<(&'a PacketField, Value)>, VsfError> {
        self.fields
            .iter()
            .map(|field| field.decode(payload).map(|value| (field, value)))
            .collect()
    }
}

/// Interpretation of a decoded field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Number,
    Reserved,
    Time,
    WeekTime,
    DateTime,
}

impl FieldType {
    fn from_raw(raw: i32) -> FieldType {
        match raw {
            2 => FieldType::Reserved,
            3 => FieldType::Time,
            4 => FieldType::WeekTime,
            5 => FieldType::DateTime,
            _ => FieldType::Number,
        }
    }
}

/// One named field of a packet template.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketField {
    /// Short identifier, e.g. `000_2_0`. Together with the packet id it
    /// forms the field's stable key.
    pub id_text: String,
    pub name_index: i32,
    pub unit_id: i32,
    pub precision: i32,
    pub field_type: FieldType,
    pub parts: Vec<FieldPart>,
}

impl PacketField {
    const DATA_LEN: i64 = 4 * 5 + 8;

    /// Stable key of this field within `packet`:
    /// `<packet_id>_<id_text>`.
    pub fn full_id(&self, packet: &PacketTemplate) -> String {
        format!("{}_{}", packet.packet_id(), self.id_text)
    }

    /// Decodes this field from a payload: the parts are summed as
    /// factor-weighted integers, and a non-zero precision scales the sum
    /// by `10^-precision` into a float.
    pub fn decode(&self, payload: &[u8]) -> Result<Value, VsfError> {
        let mut sum = 0i64;
        for part in &self.parts {
            sum += part.decode(payload)?;
        }

        Ok(if self.precision != 0 {
            Value::Float(sum as f64 * 10f64.powi(-self.precision))
        } else {
            Value::Int(sum)
        })
    }
}

/// A sub-byte slice contributing to a field's integer sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPart {
    pub offset: i32,
    pub bit_pos: u8,
    pub mask: u8,
    pub is_signed: bool,
    pub factor: i64,
}

impl FieldPart {
    const DATA_LEN: i64 = 4 + 4 + 8;

    fn decode(&self, payload: &[u8]) -> Result<i64, VsfError> {
        let offset = self.offset as usize;
        let byte = *payload.get(offset).ok_or(VsfError::ShortPayload {
            offset,
            len: payload.len(),
        })?;
        let raw = (byte & self.mask) >> self.bit_pos;
        let raw = if self.is_signed {
            raw as i8 as i64
        } else {
            raw as i64
        };
        Ok(raw * self.factor)
    }
}

struct TableRef {
    count: i32,
    offset: i32,
}

/// In-memory VBus specification, loaded once and read-only thereafter.
#[derive(Debug, Clone, PartialEq)]
pub struct VbusSpec {
    datecode: i32,
    texts: Vec<String>,
    localized_texts: Vec<LocalizedText>,
    units: Vec<Unit>,
    device_templates: Vec<DeviceTemplate>,
    packet_templates: Vec<PacketTemplate>,
}

impl VbusSpec {
    /// Bare specification around a set of packet templates.
    #[cfg(test)]
    pub(crate) fn with_packet_templates(packet_templates: Vec<PacketTemplate>) -> VbusSpec {
        VbusSpec {
            datecode: 0,
            texts: vec![],
            localized_texts: vec![],
            units: vec![],
            device_templates: vec![],
            packet_templates,
        }
    }

    /// Loads a VSF from a file on disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<VbusSpec, VsfError> {
        VbusSpec::read_from(BufReader::new(File::open(path)?))
    }

    /// Loads a VSF from any seekable byte source.
    pub fn read_from<R: Read + Seek>(reader: R) -> Result<VbusSpec, VsfError> {
        let mut r = VsfReader { inner: reader };

        let checksum_a = r.read_u16()?;
        let checksum_b = r.read_u16()?;
        if checksum_a != checksum_b {
            return Err(VsfError::Checksum {
                a: checksum_a,
                b: checksum_b,
            });
        }
        let _total_length = r.read_i32()?;
        let data_version = r.read_i32()?;
        if data_version != 1 {
            return Err(VsfError::Version(data_version));
        }
        let spec_offset = r.read_i32()?;

        r.seek(spec_offset as u64)?;
        let datecode = r.read_i32()?;
        let text_ref = r.read_table_ref()?;
        let localized_text_ref = r.read_table_ref()?;
        let unit_ref = r.read_table_ref()?;
        let device_template_ref = r.read_table_ref()?;
        let packet_template_ref = r.read_table_ref()?;

        let mut texts = Vec::with_capacity(text_ref.count as usize);
        for i in 0..text_ref.count as i64 {
            r.seek((text_ref.offset as i64 + i * 4) as u64)?;
            let text_offset = r.read_i32()?;
            texts.push(r.read_text_at(text_offset as u64)?);
        }

        let mut localized_texts = Vec::with_capacity(localized_text_ref.count as usize);
        for i in 0..localized_text_ref.count as i64 {
            r.seek((localized_text_ref.offset as i64 + i * LocalizedText::DATA_LEN) as u64)?;
            localized_texts.push(LocalizedText {
                en: r.read_i32()?,
                de: r.read_i32()?,
                fr: r.read_i32()?,
            });
        }

        let mut units = Vec::with_capacity(unit_ref.count as usize);
        for i in 0..unit_ref.count as i64 {
            r.seek((unit_ref.offset as i64 + i * Unit::DATA_LEN) as u64)?;
            units.push(Unit {
                id: r.read_i32()?,
                family_id: r.read_i32()?,
                code_index: r.read_i32()?,
                text_index: r.read_i32()?,
            });
        }

        let mut device_templates = Vec::with_capacity(device_template_ref.count as usize);
        for i in 0..device_template_ref.count as i64 {
            r.seek((device_template_ref.offset as i64 + i * DeviceTemplate::DATA_LEN) as u64)?;
            device_templates.push(DeviceTemplate {
                self_addr: r.read_u16()?,
                self_mask: r.read_u16()?,
                peer_addr: r.read_u16()?,
                peer_mask: r.read_u16()?,
                name_index: r.read_i32()?,
            });
        }

        let mut packet_templates = Vec::with_capacity(packet_template_ref.count as usize);
        for i in 0..packet_template_ref.count as i64 {
            r.seek((packet_template_ref.offset as i64 + i * PacketTemplate::DATA_LEN) as u64)?;
            packet_templates.push(r.read_packet_template(&texts)?);
        }

        let spec = VbusSpec {
            datecode,
            texts,
            localized_texts,
            units,
            device_templates,
            packet_templates,
        };
        spec.check_references()?;
        Ok(spec)
    }

    /// Verifies that every cross-reference in the loaded tables
    /// resolves.
    fn check_references(&self) -> Result<(), VsfError> {
        let text = |index: i32| {
            if index < 0 || index as usize >= self.texts.len() {
                Err(VsfError::DanglingRef {
                    table: "text",
                    index: index as i64,
                    count: self.texts.len(),
                })
            } else {
                Ok(())
            }
        };
        let localized = |index: i32| {
            if index < 0 || index as usize >= self.localized_texts.len() {
                Err(VsfError::DanglingRef {
                    table: "localized text",
                    index: index as i64,
                    count: self.localized_texts.len(),
                })
            } else {
                Ok(())
            }
        };

        for lt in &self.localized_texts {
            text(lt.en)?;
            text(lt.de)?;
            text(lt.fr)?;
        }
        for unit in &self.units {
            text(unit.code_index)?;
            text(unit.text_index)?;
        }
        for dev in &self.device_templates {
            localized(dev.name_index)?;
        }
        for packet in &self.packet_templates {
            for field in &packet.fields {
                localized(field.name_index)?;
                if self.unit_by_id(field.unit_id).is_none() {
                    return Err(VsfError::DanglingRef {
                        table: "unit",
                        index: field.unit_id as i64,
                        count: self.units.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Date code of the specification, e.g. `20221201`.
    pub fn datecode(&self) -> i32 {
        self.datecode
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn localized_texts(&self) -> &[LocalizedText] {
        &self.localized_texts
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn device_templates(&self) -> &[DeviceTemplate] {
        &self.device_templates
    }

    pub fn packet_templates(&self) -> &[PacketTemplate] {
        &self.packet_templates
    }

    /// Resolves a localized text to the requested language.
    pub fn localize(&self, index: i32, lang: Language) -> Option<&str> {
        let lt = self.localized_texts.get(usize::try_from(index).ok()?)?;
        self.text(lt.index(lang))
    }

    fn text(&self, index: i32) -> Option<&str> {
        self.texts
            .get(usize::try_from(index).ok()?)
            .map(String::as_str)
    }

    /// Unit code text, e.g. `°C`.
    pub fn unit_code(&self, unit: &Unit) -> Option<&str> {
        self.text(unit.code_index)
    }

    /// Unit display text.
    pub fn unit_text(&self, unit: &Unit) -> Option<&str> {
        self.text(unit.text_index)
    }

    pub fn unit_by_id(&self, id: i32) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Finds the device template matching a bus address, optionally
    /// narrowed by the peer it is talking to.
    pub fn device(&self, self_addr: u16, peer_addr: Option<u16>) -> Option<&DeviceTemplate> {
        self.device_templates.iter().find(|dev| {
            dev.self_addr == (self_addr & dev.self_mask)
                && peer_addr
                    .map(|peer| dev.peer_addr == (peer & dev.peer_mask))
                    .unwrap_or(true)
        })
    }

    /// Finds the first packet template matching a source/destination
    /// pair and, if given, a command.
    pub fn packet(&self, src: u16, dst: u16, command: Option<u16>) -> Option<&PacketTemplate> {
        self.packet_templates.iter().find(|pkt| {
            pkt.src_addr == (src & pkt.src_mask)
                && pkt.dst_addr == (dst & pkt.dst_mask)
                && command.map(|cmd| pkt.command == cmd).unwrap_or(true)
        })
    }

    /// Finds a packet template by its stable id,
    /// `00_<dst>_<src>_10_<command>`.
    pub fn packet_by_id(&self, packet_id: &str) -> Option<&PacketTemplate> {
        self.packet_templates
            .iter()
            .find(|pkt| pkt.packet_id() == packet_id)
    }

    /// Finds a field by its stable key, `<packet_id>_<id_text>`. Falls
    /// back to a full scan for keys that are not hierarchical to their
    /// packet id.
    pub fn field_by_id(&self, field_id: &str) -> Option<(&PacketTemplate, &PacketField)> {
        if field_id.len() > 21 {
            if let Some(packet) = self.packet_by_id(&field_id[0..20]) {
                let short_id = &field_id[21..];
                return packet
                    .fields
                    .iter()
                    .find(|f| f.id_text == short_id)
                    .map(|f| (packet, f));
            }
        }

        self.packet_templates.iter().find_map(|packet| {
            packet
                .fields
                .iter()
                .find(|f| f.full_id(packet) == field_id)
                .map(|f| (packet, f))
        })
    }
}

struct VsfReader<R>
where
    R: Read + Seek,
{
    inner: R,
}

impl<R> VsfReader<R>
where
    R: Read + Seek,
{
    fn seek(&mut self, offset: u64) -> Result<(), VsfError> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, VsfError> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16, VsfError> {
        let mut buf = [0u8; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_i32(&mut self) -> Result<i32, VsfError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64, VsfError> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_table_ref(&mut self) -> Result<TableRef, VsfError> {
        Ok(TableRef {
            count: self.read_i32()?,
            offset: self.read_i32()?,
        })
    }

    /// Reads the NUL-terminated UTF-8 string at `offset`.
    fn read_text_at(&mut self, offset: u64) -> Result<String, VsfError> {
        self.seek(offset)?;
        let mut buf = Vec::new();
        loop {
            let byte = self.read_u8()?;
            if byte == 0 {
                break;
            }
            buf.push(byte);
        }
        String::from_utf8(buf).map_err(|_| VsfError::BadText { offset })
    }

    fn read_packet_template(&mut self, texts: &[String]) -> Result<PacketTemplate, VsfError> {
        let dst_addr = self.read_u16()?;
        let dst_mask = self.read_u16()?;
        let src_addr = self.read_u16()?;
        let src_mask = self.read_u16()?;
        let command = self.read_u16()?;
        let _reserved = self.read_u16()?;
        let field_ref = self.read_table_ref()?;

        let mut fields = Vec::with_capacity(field_ref.count as usize);
        for i in 0..field_ref.count as i64 {
            self.seek((field_ref.offset as i64 + i * PacketField::DATA_LEN) as u64)?;
            fields.push(self.read_packet_field(texts)?);
        }

        Ok(PacketTemplate {
            dst_addr,
            dst_mask,
            src_addr,
            src_mask,
            command,
            fields,
        })
    }

    fn read_packet_field(&mut self, texts: &[String]) -> Result<PacketField, VsfError> {
        let id_text_index = self.read_i32()?;
        let name_index = self.read_i32()?;
        let unit_id = self.read_i32()?;
        let precision = self.read_i32()?;
        let field_type = FieldType::from_raw(self.read_i32()?);
        let part_ref = self.read_table_ref()?;

        let id_text = usize::try_from(id_text_index)
            .ok()
            .and_then(|i| texts.get(i))
            .cloned()
            .ok_or(VsfError::DanglingRef {
                table: "text",
                index: id_text_index as i64,
                count: texts.len(),
            })?;

        let mut parts = Vec::with_capacity(part_ref.count as usize);
        for i in 0..part_ref.count as i64 {
            self.seek((part_ref.offset as i64 + i * FieldPart::DATA_LEN) as u64)?;
            parts.push(FieldPart {
                offset: self.read_i32()?,
                bit_pos: self.read_u8()?,
                mask: self.read_u8()?,
                is_signed: {
                    let signed = self.read_u8()?;
                    let _reserved = self.read_u8()?;
                    signed == 1
                },
                factor: self.read_i64()?,
            });
        }

        Ok(PacketField {
            id_text,
            name_index,
            unit_id,
            precision,
            field_type,
            parts,
        })
    }
}

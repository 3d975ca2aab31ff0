//! Recorded traces
//!
//! A recording holds events along with what is needed to consume them later on another machine: the
//! names of their providers and the schemas of their events.
//!
//! ```text
//! recording = magic "ETWSREC\0" | version u32 | entry*
//! entry     = tag u8 | body length u32 | body
//! ```
//!
//! Integers are little-endian. Event headers are the exception: they are stored as the raw bytes of
//! an [`EventHeader`], so recordings are only portable between machines of the same endianness.
//! Entries with an unknown tag are skipped.
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use zerocopy::{AsBytes, FromBytes};

use crate::native::etw_types::{DecodingSource, EventHeader, ExtendedDataItem};
use crate::native::guid::Guid;
use crate::native::replay::RawEvent;
use crate::native::tdh_types::{
    Property, PropertyCount, PropertyFlags, PropertyInfo, PropertyLength, TdhInType, TdhOutType,
};
use crate::native::{NativeError, NativeResult};
use crate::schema::Schema;

pub const MAGIC: &[u8; 8] = b"ETWSREC\0";
pub const VERSION: u32 = 1;

const TAG_PROVIDER: u8 = 1;
const TAG_SCHEMA: u8 = 2;
const TAG_EVENT: u8 = 3;

/// Anything larger is considered corrupted
const MAX_ENTRY_LEN: u32 = 16 * 1024 * 1024;

/// One element of a recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Binds a provider name to its GUID
    Provider { guid: Guid, name: String },
    Schema(Schema),
    Event(RawEvent),
}

fn corrupted(what: &str) -> NativeError {
    NativeError::Corrupted(what.to_string())
}

#[derive(Default)]
struct Encoder(Vec<u8>);

impl Encoder {
    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn guid(&mut self, guid: Guid) {
        self.0.extend_from_slice(&guid.to_u128().to_le_bytes());
    }

    fn string(&mut self, value: &str) -> NativeResult<()> {
        let len = u16::try_from(value.len())
            .map_err(|_| NativeError::InvalidParameter(format!("string too long: {}", value.len())))?;
        self.u16(len);
        self.0.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn bytes(&mut self, value: &[u8]) {
        self.0.extend_from_slice(value);
    }
}

/// Bounds-checked reads over an entry body
struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn take(&mut self, len: usize) -> NativeResult<&'a [u8]> {
        if self.data.len() < len {
            return Err(corrupted("entry is shorter than its content"));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> NativeResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn u8(&mut self) -> NativeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> NativeResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> NativeResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn guid(&mut self) -> NativeResult<Guid> {
        Ok(Guid::from_u128(u128::from_le_bytes(self.array()?)))
    }

    fn string(&mut self) -> NativeResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupted("string is not valid utf-8"))
    }
}

fn encode_property(out: &mut Encoder, property: &Property) -> NativeResult<()> {
    out.string(&property.name)?;
    out.u32(property.flags.bits());
    let (kind, in_type, out_type, length, count) = match property.info {
        PropertyInfo::Value {
            in_type,
            out_type,
            length,
        } => (0, in_type, out_type, length, None),
        PropertyInfo::Array {
            in_type,
            out_type,
            length,
            count,
        } => (1, in_type, out_type, length, Some(count)),
    };
    out.u8(kind);
    out.u16(in_type as u16);
    out.u16(out_type as u16);
    match length {
        PropertyLength::Length(l) => {
            out.u8(0);
            out.u16(l);
        }
        PropertyLength::Index(i) => {
            out.u8(1);
            out.u16(i);
        }
    }
    match count {
        Some(PropertyCount::Count(c)) => {
            out.u8(0);
            out.u16(c);
        }
        Some(PropertyCount::Index(i)) => {
            out.u8(1);
            out.u16(i);
        }
        None => {}
    }
    Ok(())
}

fn decode_property(input: &mut Decoder) -> NativeResult<Property> {
    let name = input.string()?;
    let flags = PropertyFlags::from_bits_truncate(input.u32()?);
    let kind = input.u8()?;
    let in_type = TdhInType::from_raw(input.u16()?);
    let out_type = TdhOutType::from_raw(input.u16()?);
    let length = match (input.u8()?, input.u16()?) {
        (0, l) => PropertyLength::Length(l),
        (1, i) => PropertyLength::Index(i),
        _ => return Err(corrupted("unknown property length kind")),
    };
    let info = match kind {
        0 => PropertyInfo::Value {
            in_type,
            out_type,
            length,
        },
        1 => {
            let count = match (input.u8()?, input.u16()?) {
                (0, c) => PropertyCount::Count(c),
                (1, i) => PropertyCount::Index(i),
                _ => return Err(corrupted("unknown property count kind")),
            };
            PropertyInfo::Array {
                in_type,
                out_type,
                length,
                count,
            }
        }
        _ => return Err(corrupted("unknown property kind")),
    };
    Ok(Property { name, flags, info })
}

fn encode_schema(out: &mut Encoder, schema: &Schema) -> NativeResult<()> {
    out.guid(schema.provider_guid());
    out.u16(schema.event_id());
    out.u8(schema.event_version());
    out.u8(schema.opcode());
    out.u8(schema.level());
    out.u32(schema.decoding_source().into());
    out.string(schema.provider_name())?;
    out.string(schema.task_name())?;
    out.string(schema.opcode_name())?;
    out.string(schema.declared_event_name())?;
    let count = u16::try_from(schema.properties().len())
        .map_err(|_| NativeError::InvalidParameter("too many properties".to_string()))?;
    out.u16(count);
    for property in schema.properties() {
        encode_property(out, property)?;
    }
    Ok(())
}

fn decode_schema(input: &mut Decoder) -> NativeResult<Schema> {
    let mut schema = Schema::new(input.guid()?, input.u16()?)
        .with_version(input.u8()?)
        .with_opcode(input.u8()?)
        .with_level(input.u8()?)
        .with_decoding_source(DecodingSource::from(input.u32()?))
        .with_provider_name(&input.string()?)
        .with_task_name(&input.string()?)
        .with_opcode_name(&input.string()?)
        .with_event_name(&input.string()?);
    for _ in 0..input.u16()? {
        schema = schema.with_property(decode_property(input)?);
    }
    Ok(schema)
}

fn decode_provider(input: &mut Decoder) -> NativeResult<Entry> {
    let guid = input.guid()?;
    let name = input.string()?;
    Ok(Entry::Provider { guid, name })
}

fn encode_event(out: &mut Encoder, event: &RawEvent) -> NativeResult<()> {
    out.bytes(event.header.as_bytes());
    let count = u16::try_from(event.extended_data.len())
        .map_err(|_| NativeError::InvalidParameter("too many extended data items".to_string()))?;
    out.u16(count);
    for item in &event.extended_data {
        let data = item.to_raw();
        out.u16(item.data_type());
        out.u32(data.len() as u32);
        out.bytes(&data);
    }
    out.u32(event.user_data.len() as u32);
    out.bytes(&event.user_data);
    Ok(())
}

fn decode_event(input: &mut Decoder) -> NativeResult<RawEvent> {
    let header = EventHeader::read_from(input.take(EventHeader::SIZE)?)
        .ok_or_else(|| corrupted("invalid event header"))?;
    let count = input.u16()?;
    let mut extended_data = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ext_type = input.u16()?;
        let len = input.u32()? as usize;
        extended_data.push(ExtendedDataItem::from_raw(ext_type, input.take(len)?));
    }
    let len = input.u32()? as usize;
    let user_data = input.take(len)?.to_vec();
    Ok(RawEvent {
        header,
        extended_data,
        user_data,
    })
}

/// Writes a recording
pub struct RecordingWriter<W: Write> {
    writer: W,
}

impl RecordingWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> NativeResult<Self> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> RecordingWriter<W> {
    pub fn new(mut writer: W) -> NativeResult<Self> {
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        Ok(RecordingWriter { writer })
    }

    fn write_body(&mut self, tag: u8, body: Encoder) -> NativeResult<()> {
        let len = u32::try_from(body.0.len())
            .ok()
            .filter(|len| *len <= MAX_ENTRY_LEN)
            .ok_or_else(|| NativeError::InvalidParameter("entry too large".to_string()))?;
        self.writer.write_all(&[tag])?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&body.0)?;
        Ok(())
    }

    pub fn write_provider(&mut self, guid: Guid, name: &str) -> NativeResult<()> {
        let mut body = Encoder::default();
        body.guid(guid);
        body.string(name)?;
        self.write_body(TAG_PROVIDER, body)
    }

    pub fn write_schema(&mut self, schema: &Schema) -> NativeResult<()> {
        let mut body = Encoder::default();
        encode_schema(&mut body, schema)?;
        self.write_body(TAG_SCHEMA, body)
    }

    pub fn write_event(&mut self, event: &RawEvent) -> NativeResult<()> {
        let mut body = Encoder::default();
        encode_event(&mut body, event)?;
        self.write_body(TAG_EVENT, body)
    }

    pub fn write_entry(&mut self, entry: &Entry) -> NativeResult<()> {
        match entry {
            Entry::Provider { guid, name } => self.write_provider(*guid, name),
            Entry::Schema(schema) => self.write_schema(schema),
            Entry::Event(event) => self.write_event(event),
        }
    }

    /// Flush and give back the underlying writer
    pub fn finish(mut self) -> NativeResult<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Reads the entries of a recording
///
/// A malformed entry is reported as an `Err` item, and reading goes on with the next entry. A recording
/// whose framing is broken (truncated, or with an absurd entry length) ends after that error.
pub struct RecordingReader<R: Read> {
    reader: R,
    done: bool,
}

impl RecordingReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> NativeResult<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> RecordingReader<R> {
    pub fn new(mut reader: R) -> NativeResult<Self> {
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|_| corrupted("not a recording"))?;
        if &magic != MAGIC {
            return Err(corrupted("not a recording"));
        }
        let mut version = [0u8; 4];
        reader
            .read_exact(&mut version)
            .map_err(|_| corrupted("not a recording"))?;
        match u32::from_le_bytes(version) {
            VERSION => Ok(RecordingReader {
                reader,
                done: false,
            }),
            other => Err(corrupted(&format!("unsupported recording version {}", other))),
        }
    }

    /// Entries cannot be delimited anymore
    fn give_up(&mut self, err: NativeError) -> NativeError {
        self.done = true;
        err
    }

    fn read_entry(&mut self) -> Option<NativeResult<Entry>> {
        loop {
            let mut tag = [0u8; 1];
            match self.reader.read_exact(&mut tag) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => return None,
                Err(err) => return Some(Err(self.give_up(err.into()))),
            }

            let mut len = [0u8; 4];
            if self.reader.read_exact(&mut len).is_err() {
                return Some(Err(self.give_up(corrupted("truncated entry"))));
            }
            let len = u32::from_le_bytes(len);
            if len > MAX_ENTRY_LEN {
                return Some(Err(self.give_up(corrupted("entry too large"))));
            }
            let mut body = vec![0u8; len as usize];
            if self.reader.read_exact(&mut body).is_err() {
                return Some(Err(self.give_up(corrupted("truncated entry"))));
            }

            let mut input = Decoder { data: &body };
            let entry = match tag[0] {
                TAG_PROVIDER => decode_provider(&mut input),
                TAG_SCHEMA => decode_schema(&mut input).map(Entry::Schema),
                TAG_EVENT => decode_event(&mut input).map(Entry::Event),
                other => {
                    log::debug!("skipping recording entry with unknown tag {}", other);
                    continue;
                }
            };
            return Some(entry);
        }
    }
}

impl<R: Read> Iterator for RecordingReader<R> {
    type Item = NativeResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let entry = self.read_entry();
        if entry.is_none() {
            self.done = true;
        }
        entry
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::replay::PayloadBuilder;
    use crate::native::sid::Sid;

    const PROVIDER: Guid = Guid::from_u128(0x9e814aad_3204_11d2_9a82_006008a86939);

    fn schema() -> Schema {
        Schema::new(PROVIDER, 1)
            .with_version(2)
            .with_provider_name("Test-Provider")
            .with_task_name("ProcessStart")
            .with_property(Property::scalar("ProcessID", TdhInType::InTypeUInt32))
            .with_property(
                Property::scalar("Name", TdhInType::InTypeAnsiString)
                    .with_length(PropertyLength::Index(0)),
            )
            .with_property(Property::array("Values", TdhInType::InTypeUInt16, PropertyCount::Count(3)))
    }

    fn event() -> RawEvent {
        RawEvent::new(PROVIDER, 1)
            .with_process_id(1234)
            .with_extended_data(ExtendedDataItem::Sid(Sid::new(5, &[18])))
            .with_user_data(PayloadBuilder::new().u32(1234).bytes(b"abc").build())
    }

    fn recording() -> Vec<u8> {
        let mut writer = RecordingWriter::new(Vec::new()).unwrap();
        writer.write_provider(PROVIDER, "Test-Provider").unwrap();
        writer.write_schema(&schema()).unwrap();
        writer.write_event(&event()).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_read_back() {
        let entries: Vec<Entry> = RecordingReader::new(recording().as_slice())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            entries,
            vec![
                Entry::Provider {
                    guid: PROVIDER,
                    name: "Test-Provider".to_string()
                },
                Entry::Schema(schema()),
                Entry::Event(event()),
            ]
        );
    }

    #[test]
    fn test_not_a_recording() {
        assert!(matches!(
            RecordingReader::new(&b"MZ\x90\x00"[..]),
            Err(NativeError::Corrupted(_))
        ));
        let mut data = recording();
        data[8] = 2;
        assert!(matches!(
            RecordingReader::new(data.as_slice()),
            Err(NativeError::Corrupted(_))
        ));
    }

    #[test]
    fn test_truncated_recording() {
        let data = recording();
        let truncated = &data[..data.len() - 3];
        let entries: Vec<NativeResult<Entry>> = RecordingReader::new(truncated).unwrap().collect();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_ok());
        assert!(entries[1].is_ok());
        assert!(matches!(entries[2], Err(NativeError::Corrupted(_))));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let mut data = RecordingWriter::new(Vec::new()).unwrap().finish().unwrap();
        // An event entry whose body is too short for a header
        data.extend_from_slice(&[TAG_EVENT, 4, 0, 0, 0, 1, 2, 3, 4]);
        // An entry from a future version
        data.extend_from_slice(&[42, 1, 0, 0, 0, 0]);
        let mut writer = RecordingWriter { writer: data };
        writer.write_provider(PROVIDER, "Test-Provider").unwrap();
        let data = writer.finish().unwrap();

        let entries: Vec<NativeResult<Entry>> = RecordingReader::new(data.as_slice()).unwrap().collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_err());
        assert!(matches!(entries[1], Ok(Entry::Provider { .. })));
    }
}

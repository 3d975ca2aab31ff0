//! Implements the Windows time structures found in event fields.
use std::fmt;

/// A [FILETIME](https://learn.microsoft.com/en-us/windows/win32/api/minwinbase/ns-minwinbase-filetime):
/// 100ns intervals since January 1, 1601 (UTC)
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileTime(pub(crate) i64);

const SECONDS_BETWEEN_1601_AND_1970: i64 = 11_644_473_600;
const NS_IN_SECOND: i64 = 1_000_000_000;
const MS_IN_SECOND: i64 = 1_000;

impl FileTime {
    pub fn from_quad(quad: i64) -> Self {
        FileTime(quad)
    }

    /// Build a `FileTime` from a unix timestamp in milliseconds
    pub fn from_unix_timestamp_millis(millis: i64) -> Self {
        FileTime((millis + SECONDS_BETWEEN_1601_AND_1970 * MS_IN_SECOND) * 10_000)
    }

    /// Converts to a unix timestamp with millisecond granularity.
    pub fn as_unix_timestamp(&self) -> i64 {
        self.0 / 10_000 - (SECONDS_BETWEEN_1601_AND_1970 * MS_IN_SECOND)
    }

    /// Converts to a unix timestamp with nanosecond granularity.
    pub fn as_unix_timestamp_nanos(&self) -> i128 {
        self.0 as i128 * 100 - (SECONDS_BETWEEN_1601_AND_1970 as i128 * NS_IN_SECOND as i128)
    }

    /// Converts to OffsetDateTime
    ///
    /// Returns `None` for values outside of the range `time` can represent.
    #[cfg(feature = "time_rs")]
    pub fn as_date_time(&self) -> Option<time::OffsetDateTime> {
        time::OffsetDateTime::from_unix_timestamp_nanos(self.as_unix_timestamp_nanos()).ok()
    }

    pub fn as_quad(&self) -> i64 {
        self.0
    }

    pub(crate) fn from_slice(slice: &[u8; 8]) -> Self {
        // dwLowDateTime comes first
        let low = u32::from_ne_bytes([slice[0], slice[1], slice[2], slice[3]]) as i64;
        let high = u32::from_ne_bytes([slice[4], slice[5], slice[6], slice[7]]) as i64;
        FileTime((high << 32) | low)
    }
}

impl fmt::Debug for FileTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileTime({}ms since epoch)", self.as_unix_timestamp())
    }
}

#[cfg(feature = "time_rs")]
impl TryFrom<FileTime> for time::OffsetDateTime {
    type Error = time::error::ComponentRange;

    fn try_from(file_time: FileTime) -> Result<Self, Self::Error> {
        time::OffsetDateTime::from_unix_timestamp_nanos(file_time.as_unix_timestamp_nanos())
    }
}

#[cfg(feature = "serde")]
impl serde::ser::Serialize for FileTime {
    #[cfg(feature = "time_rs")]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.as_date_time() {
            Some(date) => date.serialize(serializer),
            None => self.as_unix_timestamp().serialize(serializer),
        }
    }

    #[cfg(not(feature = "time_rs"))]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.as_unix_timestamp().serialize(serializer)
    }
}

/// A [SYSTEMTIME](https://learn.microsoft.com/en-us/windows/win32/api/minwinbase/ns-minwinbase-systemtime) (UTC)
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SystemTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub milliseconds: u16,
}

/// Days since 1970-01-01 of a proleptic Gregorian date
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

impl SystemTime {
    /// Converts to a unix timestamp with millisecond granularity.
    pub fn as_unix_timestamp(&self) -> i64 {
        let days = days_from_civil(self.year as i64, self.month as i64, self.day as i64);
        let seconds = days * 86_400
            + self.hour as i64 * 3_600
            + self.minute as i64 * 60
            + self.second as i64;
        seconds * MS_IN_SECOND + self.milliseconds as i64
    }

    /// Converts to a unix timestamp with nanosecond granularity.
    pub fn as_unix_timestamp_nanos(&self) -> i128 {
        self.as_unix_timestamp() as i128 * 1_000_000
    }

    pub fn as_file_time(&self) -> FileTime {
        FileTime::from_unix_timestamp_millis(self.as_unix_timestamp())
    }

    /// Converts to OffsetDateTime
    #[cfg(feature = "time_rs")]
    pub fn as_date_time(&self) -> Option<time::OffsetDateTime> {
        time::OffsetDateTime::from_unix_timestamp_nanos(self.as_unix_timestamp_nanos()).ok()
    }

    pub(crate) fn from_slice(slice: &[u8; 16]) -> Self {
        let word = |i: usize| u16::from_ne_bytes([slice[2 * i], slice[2 * i + 1]]);
        SystemTime {
            year: word(0),
            month: word(1),
            day_of_week: word(2),
            day: word(3),
            hour: word(4),
            minute: word(5),
            second: word(6),
            milliseconds: word(7),
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let words = [
            self.year,
            self.month,
            self.day_of_week,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.milliseconds,
        ];
        let mut out = [0u8; 16];
        for (i, w) in words.iter().enumerate() {
            out[2 * i..2 * i + 2].copy_from_slice(&w.to_ne_bytes());
        }
        out
    }
}

#[cfg(feature = "time_rs")]
impl TryFrom<SystemTime> for time::OffsetDateTime {
    type Error = time::error::ComponentRange;

    fn try_from(system_time: SystemTime) -> Result<Self, Self::Error> {
        time::OffsetDateTime::from_unix_timestamp_nanos(system_time.as_unix_timestamp_nanos())
    }
}

#[cfg(feature = "serde")]
impl serde::ser::Serialize for SystemTime {
    #[cfg(feature = "time_rs")]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.as_date_time() {
            Some(date) => date.serialize(serializer),
            None => self.as_unix_timestamp().serialize(serializer),
        }
    }

    #[cfg(not(feature = "time_rs"))]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.as_unix_timestamp().serialize(serializer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_time_epoch() {
        let epoch = FileTime::from_quad(116_444_736_000_000_000);
        assert_eq!(epoch.as_unix_timestamp(), 0);
        assert_eq!(epoch.as_unix_timestamp_nanos(), 0);
        assert_eq!(FileTime::from_unix_timestamp_millis(0), epoch);
    }

    #[test]
    fn test_file_time_from_slice() {
        let quad: i64 = 0x01d9_0000_1234_5678;
        let time = FileTime::from_slice(&quad.to_le_bytes());
        if cfg!(target_endian = "little") {
            assert_eq!(time.as_quad(), quad);
        }
    }

    #[test]
    fn test_system_time() {
        let st = SystemTime {
            year: 2023,
            month: 3,
            day_of_week: 3,
            day: 15,
            hour: 12,
            minute: 30,
            second: 45,
            milliseconds: 500,
        };
        // 2023-03-15T12:30:45.500Z
        assert_eq!(st.as_unix_timestamp(), 1_678_883_445_500);
        assert_eq!(SystemTime::from_slice(&st.to_bytes()), st);
        assert_eq!(st.as_file_time().as_unix_timestamp(), 1_678_883_445_500);
    }

    #[test]
    fn test_system_time_before_epoch() {
        let st = SystemTime {
            year: 1601,
            month: 1,
            day: 1,
            ..Default::default()
        };
        assert_eq!(st.as_file_time().as_quad(), 0);
    }
}

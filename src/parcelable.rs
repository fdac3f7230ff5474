//! Typed payloads over the parcel codec, AIDL convention. Derivable for
//! structs and discriminated enums with `#[derive(Parcelable)]`.

use std::collections::HashMap;
use std::hash::Hash;

use crate::reader::Reader;
use crate::writer::Writer;
use crate::Error;

pub trait Parcelable {
    fn read(reader: &mut Reader) -> Result<Self, Error>
    where
        Self: Sized;
    fn write(&self, writer: &mut Writer);
}

/// A string carried as UTF-16 on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct String16(pub String);

macro_rules! implement_primitive {
    ($ty:ty, $read:ident, $wty:ty, $write:ident) => {
        impl Parcelable for $ty {
            fn read(reader: &mut Reader) -> Result<Self, Error>
            where
                Self: Sized,
            {
                Ok(reader.$read().ok_or(Error::DeserializationError)? as $ty)
            }
            fn write(&self, writer: &mut Writer) {
                writer.$write(*self as $wty);
            }
        }
    };
}

implement_primitive!(u8, read_i32, i32, append_i32);
implement_primitive!(i8, read_i32, i32, append_i32);
implement_primitive!(u16, read_i32, i32, append_i32);
implement_primitive!(i16, read_i32, i32, append_i32);
implement_primitive!(i32, read_i32, i32, append_i32);
implement_primitive!(u32, read_u32, u32, append_u32);
implement_primitive!(i64, read_i64, i64, append_i64);
implement_primitive!(u64, read_u64, u64, append_u64);

impl Parcelable for f32 {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        reader.read_f32().ok_or(Error::DeserializationError)
    }
    fn write(&self, writer: &mut Writer) {
        writer.append_f32(*self);
    }
}

impl Parcelable for f64 {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        reader.read_f64().ok_or(Error::DeserializationError)
    }
    fn write(&self, writer: &mut Writer) {
        writer.append_f64(*self);
    }
}

impl Parcelable for bool {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        reader.read_bool().ok_or(Error::DeserializationError)
    }
    fn write(&self, writer: &mut Writer) {
        writer.append_bool(*self);
    }
}

impl Parcelable for String {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        reader.read_string8().ok_or(Error::DeserializationError)
    }
    fn write(&self, writer: &mut Writer) {
        writer.append_string8(Some(self));
    }
}

impl Parcelable for String16 {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        reader.read_string16()
            .map(String16)
            .ok_or(Error::DeserializationError)
    }
    fn write(&self, writer: &mut Writer) {
        writer.append_string16(Some(&self.0));
    }
}

impl<T: Parcelable> Parcelable for Option<T> {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        let prefix = reader.read_i32().ok_or(Error::DeserializationError)?;
        Ok(if prefix != 0 && prefix != -1 {
            Some(T::read(reader)?)
        } else {
            None
        })
    }
    fn write(&self, writer: &mut Writer) {
        match self {
            Some(value) => {
                writer.append_i32(1);
                value.write(writer);
            }
            None => writer.append_i32(0),
        }
    }
}

impl<T: Parcelable> Parcelable for Box<T> {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        Ok(Box::new(T::read(reader)?))
    }
    fn write(&self, writer: &mut Writer) {
        self.as_ref().write(writer);
    }
}

impl<T: Parcelable> Parcelable for Vec<T> {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        let len = reader.read_i32().ok_or(Error::DeserializationError)?;
        if len < 0 {
            return Err(Error::DeserializationError);
        }
        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            out.push(T::read(reader)?);
        }
        Ok(out)
    }
    fn write(&self, writer: &mut Writer) {
        writer.append_i32(self.len() as i32);
        for value in self {
            value.write(writer);
        }
    }
}

impl<K: Parcelable + Eq + Hash, V: Parcelable> Parcelable for HashMap<K, V> {
    fn read(reader: &mut Reader) -> Result<Self, Error> {
        let len = reader.read_i32().ok_or(Error::DeserializationError)?;
        if len < 0 {
            return Err(Error::DeserializationError);
        }
        let mut out = HashMap::new();
        for _ in 0..len {
            out.insert(K::read(reader)?, V::read(reader)?);
        }
        Ok(out)
    }
    fn write(&self, writer: &mut Writer) {
        writer.append_i32(self.len() as i32);
        for (key, value) in self {
            key.write(writer);
            value.write(writer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IO64;
    use crate::reader::testutil::reader_for;
    use crate::writer::WriterData;

    fn roundtrip<T: Parcelable + PartialEq + std::fmt::Debug>(value: T) {
        let mut data = WriterData::new(&IO64);
        value.write(&mut Writer::new(&mut data));
        let mut reader = reader_for(&data);
        assert_eq!(T::read(&mut reader).unwrap(), value);
    }

    #[test]
    fn primitives() {
        roundtrip(0x7fu8);
        roundtrip(-5i16);
        roundtrip(123456789i32);
        roundtrip(u64::MAX);
        roundtrip(2.5f32);
        roundtrip(true);
    }

    #[test]
    fn strings() {
        roundtrip("hello".to_string());
        roundtrip(String16("p\u{00e4}iv\u{00e4}\u{00e4}".to_string()));
    }

    #[test]
    fn containers() {
        roundtrip(vec![1i32, 2, 3]);
        roundtrip(Some(7i32));
        roundtrip(Option::<i32>::None);
        roundtrip(Box::new(42i64));
        let mut map = HashMap::new();
        map.insert(1i32, "one".to_string());
        map.insert(2, "two".to_string());
        roundtrip(map);
    }

    #[derive(Debug, PartialEq, crate::DeriveParcelable)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[derive(Debug, PartialEq, crate::DeriveParcelable)]
    enum Shape {
        Dot,
        Line(Point, Point),
        Label { text: String },
    }

    #[test]
    fn derived_struct_roundtrip() {
        roundtrip(Point { x: -3, y: 14 });
    }

    #[test]
    fn derived_enum_roundtrip() {
        roundtrip(Shape::Dot);
        roundtrip(Shape::Line(Point { x: 0, y: 1 }, Point { x: 2, y: 3 }));
        roundtrip(Shape::Label { text: "axis".to_string() });
    }
}

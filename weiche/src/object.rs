use bitflags::bitflags;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectType {
    Module = 0b0000,
    Executable = 0b0001,
    Alias = 0b0010,
    Bucket = 0b0011,
    BinArray = 0b0100,
    Array = 0b0101,
    Message = 0b0110,
    Activation = 0b0111,
    MethodTable = 0b1000,
    Max = 0b1111,
}

bitflags! {
    #[derive(Debug, Copy, Clone)]
    pub struct HeaderFlags: u8 {
        const MARK = 1 << 0;
        const PIN = 1 << 1;
    }
}

// [0..<2 tag]
// [2..<6 object type]
// [8..<12 age]
// [12..<16 flags]
// [32..<64 additional data]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Header(u64);

impl Header {
    pub const TAG_SHIFT: u64 = 0;
    pub const TAG_MASK: u64 = 0b11 << Self::TAG_SHIFT;

    pub const OBJ_SHIFT: u64 = 2;
    pub const OBJ_MASK: u64 = 0b1111 << Self::OBJ_SHIFT;

    pub const AGE_SHIFT: u64 = 8;
    pub const AGE_MASK: u64 = 0xF << Self::AGE_SHIFT;

    pub const FLAGS_SHIFT: u64 = 12;
    pub const FLAGS_MASK: u64 = 0xF << Self::FLAGS_SHIFT;

    pub const DATA_SHIFT: u64 = 32;
    pub const DATA_MASK: u64 = 0xFFFF_FFFFu64 << Self::DATA_SHIFT;

    // low two bits mark this word as a header for the external collector
    const HEADER_TAG: u64 = 0b11;

    #[inline]
    pub fn encode(ty: ObjectType, age: u8, flags: HeaderFlags, data: u32) -> Header {
        let inner = Self::HEADER_TAG
            | ((ty as u64) << Self::OBJ_SHIFT)
            | (((age as u64) & 0xF) << Self::AGE_SHIFT)
            | (((flags.bits() as u64) & 0xF) << Self::FLAGS_SHIFT)
            | ((data as u64) << Self::DATA_SHIFT);

        Header(inner)
    }

    #[inline]
    pub fn zeroed() -> Self {
        Self(0)
    }

    #[inline]
    pub fn object_type(self) -> ObjectType {
        match ((self.0 & Self::OBJ_MASK) >> Self::OBJ_SHIFT) as u8 {
            0b0000 => ObjectType::Module,
            0b0001 => ObjectType::Executable,
            0b0010 => ObjectType::Alias,
            0b0011 => ObjectType::Bucket,
            0b0100 => ObjectType::BinArray,
            0b0101 => ObjectType::Array,
            0b0110 => ObjectType::Message,
            0b0111 => ObjectType::Activation,
            0b1000 => ObjectType::MethodTable,
            _ => ObjectType::Max,
        }
    }

    #[inline]
    pub fn age(self) -> u8 {
        ((self.0 & Self::AGE_MASK) >> Self::AGE_SHIFT) as u8
    }

    #[inline]
    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(((self.0 & Self::FLAGS_MASK) >> Self::FLAGS_SHIFT) as u8)
    }

    #[inline]
    pub fn data(self) -> u32 {
        ((self.0 & Self::DATA_MASK) >> Self::DATA_SHIFT) as u32
    }

    #[inline]
    pub fn set_flags(&mut self, flags: HeaderFlags) -> &mut Self {
        let f = ((flags.bits() as u64) & 0xF) << Self::FLAGS_SHIFT;
        self.0 = (self.0 & !Self::FLAGS_MASK) | f;
        self
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        self.flags().contains(HeaderFlags::MARK)
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("object_type", &self.object_type())
            .field("age", &self.age())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Marker for types that live in the VM heap arena. Every implementor is
/// `#[repr(C)]` with a `Header` as its first field.
pub trait HeapObject {}

//! Flattened device tree (FDT) query library.
//!
//! A zero-copy view over a DTB blob: nodes and properties are parsed lazily
//! while iterating, nothing is allocated. The kernel uses this to discover
//! memory, CPUs, the chosen node, and devices by `compatible` string.
//!
//! The [`writer`] module provides the sequential builder the VMM uses to
//! synthesize device trees for its guests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod writer;

use core::fmt;

use nom::{
    bytes::complete::{tag, take, take_while},
    combinator::map_res,
    multi::many0_count,
    number::complete::{be_u32, be_u64},
    IResult,
};

const FDT_MAGIC: u32 = 0xd00dfeed;

const FDT_BEGIN_NODE: [u8; 4] = [0, 0, 0, 1];
const FDT_END_NODE: [u8; 4] = [0, 0, 0, 2];
const FDT_PROP: [u8; 4] = [0, 0, 0, 3];
const FDT_NOP: [u8; 4] = [0, 0, 0, 4];

/// A parsed flattened device tree.
#[derive(Clone)]
pub struct Fdt<'a> {
    hdr: Header,
    data: &'a [u8],
}

impl<'a> Fdt<'a> {
    /// Parses the FDT header and validates the blob dimensions.
    pub fn from_bytes(fdt: &'a [u8]) -> Result<Self, FdtParseError<'a>> {
        let hdr = Header::from_bytes(fdt)?;

        if hdr.totalsize as usize > fdt.len() {
            return Err(FdtParseError::Truncated);
        }

        Ok(Self { hdr, data: fdt })
    }

    /// Total size of the blob according to its header.
    pub fn totalsize(&self) -> usize {
        self.hdr.totalsize as usize
    }

    /// Iterates the memory reservation block.
    pub fn reserved_memory_map(
        &self,
    ) -> impl Iterator<Item = Result<ReserveEntry, FdtParseError<'a>>> + '_ {
        self.data[self.hdr.off_mem_rsvmap as usize..]
            .chunks_exact(16)
            .map(ReserveEntry::from_bytes)
            .take_while(|res| match res {
                Ok(res) => !res.is_empty(),
                _ => false,
            })
    }

    /// Returns the root node.
    pub fn root_node(&'a self) -> Result<Node<'a>, FdtParseError<'a>> {
        Node::from_bytes(
            self,
            &self.data[self.hdr.off_dt_struct as usize
                ..(self.hdr.off_dt_struct + self.hdr.size_dt_struct) as usize],
        )
    }

    /// Looks up a node by its absolute path, `@address` suffixes optional.
    pub fn find_by_path(&'a self, path: &str) -> Result<Option<Node<'a>>, FdtParseError<'a>> {
        let root = self.root_node()?;

        if path.is_empty() || path == "/" {
            return Ok(Some(root));
        }

        let mut node = root;

        for name in path.trim_start_matches('/').split('/') {
            if let Some(child) = node
                .children()
                .find(|n| n.identifier() == name || n.name() == name)
            {
                node = child;
            } else {
                return Ok(None);
            }
        }

        Ok(Some(node))
    }

    /// Depth-first iteration over every node in the tree.
    pub fn nodes(&'a self) -> Result<NodesIter<'a>, FdtParseError<'a>> {
        Ok(NodesIter {
            stack: alloc::vec![self.root_node()?],
        })
    }

    /// Finds the first node whose `compatible` list contains one of `with`.
    pub fn find_compatible(&'a self, with: &[&str]) -> Result<Option<Node<'a>>, FdtParseError<'a>> {
        Ok(self.nodes()?.find(|n| {
            n.property::<StringList>("compatible")
                .map(|mut c| c.any(|c| with.contains(&c)))
                .unwrap_or(false)
        }))
    }

    fn get_string(&self, off: u32) -> Option<&'a str> {
        let start = self.hdr.off_dt_strings + off;
        let len = self.data[start as usize..].iter().position(|&b| b == 0)?;

        let s = self.data.get(start as usize..start as usize + len)?;
        core::str::from_utf8(s).ok()
    }
}

/// Depth-first node iterator.
pub struct NodesIter<'a> {
    stack: alloc::vec::Vec<Node<'a>>,
}

impl<'a> Iterator for NodesIter<'a> {
    type Item = Node<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children());
        Some(node)
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    totalsize: u32,
    off_dt_struct: u32,
    off_dt_strings: u32,
    off_mem_rsvmap: u32,
    version: u32,
    last_comp_version: u32,
    size_dt_struct: u32,
}

impl Header {
    fn from_bytes(s: &[u8]) -> Result<Self, FdtParseError> {
        let (_, (magic, header)) = Header::parse(s).map_err(FdtParseError::ParseError)?;

        if magic != FDT_MAGIC {
            return Err(FdtParseError::InvalidHeader);
        }

        if header.version < 17 || header.last_comp_version > 17 {
            return Err(FdtParseError::UnsupportedVersion(header.last_comp_version));
        }

        Ok(header)
    }

    fn parse(input: &[u8]) -> IResult<&[u8], (u32, Self)> {
        let (input, magic) = be_u32(input)?;
        let (input, totalsize) = be_u32(input)?;
        let (input, off_dt_struct) = be_u32(input)?;
        let (input, off_dt_strings) = be_u32(input)?;
        let (input, off_mem_rsvmap) = be_u32(input)?;
        let (input, version) = be_u32(input)?;
        let (input, last_comp_version) = be_u32(input)?;
        let (input, _boot_cpuid_phys) = be_u32(input)?;
        let (input, _size_dt_strings) = be_u32(input)?;
        let (input, size_dt_struct) = be_u32(input)?;

        Ok((
            input,
            (
                magic,
                Self {
                    totalsize,
                    off_dt_struct,
                    off_dt_strings,
                    off_mem_rsvmap,
                    version,
                    last_comp_version,
                    size_dt_struct,
                },
            ),
        ))
    }
}

/// An entry of the memory reservation block.
#[derive(Debug, Clone, Copy)]
pub struct ReserveEntry {
    /// Reserved region base address.
    pub address: u64,
    /// Reserved region size in bytes.
    pub size: u64,
}

impl ReserveEntry {
    fn from_bytes(s: &[u8]) -> Result<Self, FdtParseError> {
        Ok(Self::parse(s).map_err(FdtParseError::ParseError)?.1)
    }

    /// Whether this is the all-zero list terminator.
    pub fn is_empty(&self) -> bool {
        self.address == 0 && self.size == 0
    }

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, address) = be_u64(input)?;
        let (input, size) = be_u64(input)?;

        Ok((input, Self { address, size }))
    }
}

/// A device tree node.
#[derive(Clone)]
pub struct Node<'a> {
    span: usize,
    name: &'a str,
    props: PropertyIter<'a>,
    children: NodeIter<'a>,
}

impl<'a> Node<'a> {
    fn from_bytes(fdt: &'a Fdt<'a>, s: &'a [u8]) -> Result<Self, FdtParseError<'a>> {
        Ok(Node::parse(fdt, s).map_err(FdtParseError::ParseError)?.1)
    }

    /// The full node name, including any `@address` suffix.
    pub fn identifier(&self) -> &'a str {
        self.name
    }

    /// The node name with any `@address` suffix removed.
    pub fn name(&self) -> &'a str {
        self.name
            .split_once('@')
            .map(|(name, _)| name)
            .unwrap_or(self.name)
    }

    /// The `@address` suffix of the node name, if present.
    pub fn address(&self) -> Option<&'a str> {
        self.name.split_once('@').map(|(_, addr)| addr)
    }

    /// Iterates over this node's properties.
    pub fn properties(&self) -> impl Iterator<Item = Property<'a>> {
        self.props.clone()
    }

    /// Returns a property decoded as `T`, if present.
    pub fn property<T: 'a>(&self, name: &str) -> Option<T>
    where
        T: PropValue<'a>,
    {
        self.properties()
            .find(|p| p.name() == Some(name))
            .and_then(|p| p.value())
    }

    /// Iterates over this node's children.
    pub fn children(&self) -> impl Iterator<Item = Node<'a>> {
        self.children.clone()
    }

    /// Decodes the `reg` property as `(address, size)` pairs with the given
    /// cell counts (in 32-bit cells each).
    pub fn reg(&self, address_cells: u32, size_cells: u32) -> RegIter<'a> {
        RegIter {
            data: self
                .properties()
                .find(|p| p.name() == Some("reg"))
                .map(|p| p.raw_value())
                .unwrap_or(&[]),
            address_cells,
            size_cells,
        }
    }

    /// Whether the node's `status` property, if any, reports it usable.
    pub fn is_available(&self) -> bool {
        match self.property::<&str>("status") {
            None => true,
            Some(s) => s == "okay" || s == "ok",
        }
    }

    fn span(&self) -> usize {
        self.span
    }

    fn parse(fdt: &'a Fdt<'a>, input: &'a [u8]) -> IResult<&'a [u8], Self> {
        let start = input;

        let (input, _) = many0_count(tag(&FDT_NOP))(input)?;
        let (input, _) = tag(&FDT_BEGIN_NODE)(input)?;

        // NUL terminated name, padded to 4 bytes
        let (input, name) = map_res(take_while(|c| c != 0), core::str::from_utf8)(input)?;
        let (input, _) = tag(&[0][..])(input)?;
        let n = start.len() - input.len();
        let next = (n + 3) & !3;
        let (input, _) = take(next - n)(input)?;

        let props = PropertyIter::new(fdt, input);
        let (input, _) = take(props.clone().span())(input)?;

        let children = NodeIter::new(fdt, input);
        let (input, _) = take(children.clone().span())(input)?;

        let (input, _) = many0_count(tag(&FDT_NOP))(input)?;
        let (input, _) = tag(&FDT_END_NODE)(input)?;

        let span = start.len() - input.len();

        Ok((
            input,
            Self {
                span,
                name,
                props,
                children,
            },
        ))
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("name", &self.name).finish()
    }
}

/// Iterator over `(address, size)` pairs of a `reg` property.
#[derive(Debug, Clone)]
pub struct RegIter<'a> {
    data: &'a [u8],
    address_cells: u32,
    size_cells: u32,
}

impl Iterator for RegIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let mut cells = |n: u32| -> Option<u64> {
            let mut v = 0u64;
            for _ in 0..n {
                let (data, cell) = u32::parse(self.data)?;
                self.data = data;
                v = (v << 32) | cell as u64;
            }
            Some(v)
        };

        let addr = cells(self.address_cells)?;
        let size = cells(self.size_cells)?;
        Some((addr, size))
    }
}

#[derive(Clone)]
struct PropertyIter<'a> {
    fdt: &'a Fdt<'a>,
    data: &'a [u8],
}

impl<'a> PropertyIter<'a> {
    fn new(fdt: &'a Fdt<'a>, data: &'a [u8]) -> Self {
        Self { fdt, data }
    }

    fn span(self) -> usize {
        self.map(|prop| prop.span()).sum()
    }
}

impl<'a> Iterator for PropertyIter<'a> {
    type Item = Property<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (data, prop) = Property::parse(self.fdt, self.data).ok()?;
        self.data = data;
        Some(prop)
    }
}

/// A single node property.
#[derive(Debug, Clone)]
pub struct Property<'a> {
    span: usize,
    name: Option<&'a str>,
    data: &'a [u8],
}

impl<'a> Property<'a> {
    /// The property name, resolved from the strings block.
    pub fn name(&self) -> Option<&'a str> {
        self.name
    }

    /// The raw property bytes.
    pub fn raw_value(&self) -> &'a [u8] {
        self.data
    }

    /// The property value decoded as `T`.
    pub fn value<T>(&self) -> Option<T>
    where
        T: PropValue<'a> + 'a,
    {
        T::parse(self.data).map(|(_, t)| t)
    }

    fn span(&self) -> usize {
        self.span
    }

    fn parse(fdt: &'a Fdt<'a>, input: &'a [u8]) -> IResult<&'a [u8], Self> {
        let start = input;

        let (input, _) = many0_count(tag(&FDT_NOP))(input)?;
        let (input, _) = tag(&FDT_PROP)(input)?;

        let (input, len) = be_u32(input)?;
        let (input, name_off) = be_u32(input)?;
        let (input, data) = take(len)(input)?;

        // Pad to 4 bytes
        let n = start.len() - input.len();
        let span = (n + 3) & !3;
        let (input, _) = take(span - n)(input)?;

        Ok((
            input,
            Self {
                span,
                name: fdt.get_string(name_off),
                data,
            },
        ))
    }
}

#[derive(Clone)]
struct NodeIter<'a> {
    fdt: &'a Fdt<'a>,
    data: &'a [u8],
}

impl<'a> NodeIter<'a> {
    fn new(fdt: &'a Fdt<'a>, data: &'a [u8]) -> Self {
        Self { fdt, data }
    }

    fn span(self) -> usize {
        self.map(|node| node.span()).sum()
    }
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = Node<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (data, node) = Node::parse(self.fdt, self.data).ok()?;
        self.data = data;
        Some(node)
    }
}

/// A property value of `<prop-encoded-array>` shape, decoded element-wise.
pub struct PropEncodedArray<'v, T>
where
    T: PropValue<'v>,
{
    data: &'v [u8],
    _marker: core::marker::PhantomData<T>,
}

impl<'v, T: 'v> Iterator for PropEncodedArray<'v, T>
where
    T: PropValue<'v>,
{
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let (data, t) = T::parse(self.data)?;
        self.data = data;
        Some(t)
    }
}

/// A `<stringlist>` property value.
pub struct StringList<'v> {
    data: &'v [u8],
}

impl<'v> Iterator for StringList<'v> {
    type Item = &'v str;

    fn next(&mut self) -> Option<Self::Item> {
        let (data, s) = Self::Item::parse(self.data)?;
        self.data = data;
        Some(s)
    }
}

/// Types decodable from raw property bytes.
pub trait PropValue<'v>: Sized {
    /// Decodes a value, returning the remaining bytes.
    fn parse(data: &'v [u8]) -> Option<(&'v [u8], Self)>
    where
        Self: 'v;
}

impl PropValue<'_> for u32 {
    fn parse(data: &[u8]) -> Option<(&[u8], Self)> {
        if data.len() < 4 {
            return None;
        }

        let (data, rest) = data.split_at(4);
        (rest, u32::from_be_bytes(data.try_into().unwrap())).into()
    }
}

impl PropValue<'_> for u64 {
    fn parse(data: &[u8]) -> Option<(&[u8], Self)> {
        let (data, hi) = u32::parse(data)?;
        let (data, lo) = u32::parse(data)?;
        (data, ((hi as u64) << 32) | lo as u64).into()
    }
}

impl<'v> PropValue<'v> for &'v [u8] {
    fn parse(data: &'v [u8]) -> Option<(&'v [u8], Self)> {
        Some((&[], data))
    }
}

impl<'v> PropValue<'v> for &'v str {
    fn parse(data: &'v [u8]) -> Option<(&'v [u8], Self)> {
        let n = data.iter().position(|&b| b == 0)?;
        let (data, rest) = data.split_at(n);
        (&rest[1..], core::str::from_utf8(data).ok()?).into()
    }
}

impl<'v, T: 'v, U: 'v> PropValue<'v> for (T, U)
where
    T: PropValue<'v>,
    U: PropValue<'v>,
{
    fn parse(data: &'v [u8]) -> Option<(&'v [u8], Self)> {
        let (data, t) = T::parse(data)?;
        let (data, u) = U::parse(data)?;
        (data, (t, u)).into()
    }
}

impl<'v, T: 'v> PropValue<'v> for PropEncodedArray<'v, T>
where
    T: PropValue<'v>,
{
    fn parse(data: &'v [u8]) -> Option<(&'v [u8], Self)> {
        Some((
            &[], // prop-encoded-arrays consume all data
            PropEncodedArray {
                data,
                _marker: core::marker::PhantomData,
            },
        ))
    }
}

impl<'v> PropValue<'v> for StringList<'v> {
    fn parse(data: &'v [u8]) -> Option<(&'v [u8], Self)> {
        Some((
            &[], // string-lists consume all data
            StringList { data },
        ))
    }
}

/// Errors produced while parsing a blob.
#[derive(Debug)]
pub enum FdtParseError<'e> {
    /// The blob is shorter than its header claims.
    Truncated,
    /// The header magic is wrong.
    InvalidHeader,
    /// The blob's version is unsupported.
    UnsupportedVersion(u32),
    /// A structural parse error.
    ParseError(nom::Err<nom::error::Error<&'e [u8]>>),
}

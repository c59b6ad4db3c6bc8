//! Adaptive order-2 PPM range coder.
//!
//! The optional packet compressor. Symbols live in a fixed pool and form
//! binary indexed trees per context; child links are relative offsets
//! within the pool, parent links are absolute indices. Encoder and decoder
//! apply identical model updates so their states stay synchronised.
//!
//! Tuned for packet-sized inputs rather than large-file compression.

/// Packet compressor/decompressor installed on a host.
///
/// Both methods return the number of bytes produced, or 0 when the output
/// does not fit in `output` (for compression this doubles as "not worth
/// it" — the host only transmits compressed data strictly smaller than
/// the original).
pub trait Compressor: Send {
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> usize;
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> usize;
}

const RANGE_TOP: u32 = 1 << 24;
const RANGE_BOTTOM: u32 = 1 << 16;

const CONTEXT_SYMBOL_DELTA: u8 = 3;
const CONTEXT_SYMBOL_MINIMUM: u16 = 1;
const CONTEXT_ESCAPE_MINIMUM: u16 = 1;

const SUBCONTEXT_ORDER: usize = 2;
const SUBCONTEXT_SYMBOL_DELTA: u8 = 2;
const SUBCONTEXT_ESCAPE_DELTA: u16 = 5;

/// Enough symbols for reasonable MTUs; the model resets when exhausted.
const SYMBOL_POOL_SIZE: usize = 4096;

/// Totals close to the coder bottom force a rescale.
const TOTAL_RESCALE_LIMIT: u16 = (RANGE_BOTTOM - 0x100) as u16;

#[derive(Debug, Clone, Copy, Default)]
struct Symbol {
    // binary indexed tree node
    value: u8,
    count: u8,
    under: u16,
    left: u16,
    right: u16,

    // context rooted at this symbol
    symbols: u16,
    escapes: u16,
    total: u16,
    parent: u16,
}

/// Where to store a freshly linked symbol index: the `predicted` head or
/// an earlier symbol's parent field.
#[derive(Clone, Copy)]
enum ParentSlot {
    Predicted,
    Symbol(usize),
}

/// The default packet compressor.
pub struct RangeCoder {
    symbols: Box<[Symbol]>,
}

impl Default for RangeCoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeCoder {
    pub fn new() -> Self {
        Self {
            symbols: vec![Symbol::default(); SYMBOL_POOL_SIZE].into_boxed_slice(),
        }
    }

    fn create_symbol(&mut self, next: &mut usize, value: u8, count: u8) -> usize {
        let idx = *next;
        *next += 1;
        self.symbols[idx] = Symbol {
            value,
            count,
            under: count as u16,
            ..Symbol::default()
        };
        idx
    }

    fn create_context(&mut self, next: &mut usize, escapes: u16, minimum: u16) -> usize {
        let ctx = self.create_symbol(next, 0, 0);
        let symbol = &mut self.symbols[ctx];
        symbol.escapes = escapes;
        symbol.total = escapes + 256 * minimum;
        symbol.symbols = 0;
        ctx
    }

    fn rescale_symbol(&mut self, mut idx: usize) -> u16 {
        let mut total: u16 = 0;
        loop {
            let count = self.symbols[idx].count;
            self.symbols[idx].count = count - (count >> 1);
            self.symbols[idx].under = self.symbols[idx].count as u16;
            let left = self.symbols[idx].left;
            if left != 0 {
                let sub = self.rescale_symbol(idx + left as usize);
                self.symbols[idx].under = self.symbols[idx].under.wrapping_add(sub);
            }
            total = total.wrapping_add(self.symbols[idx].under);
            let right = self.symbols[idx].right;
            if right == 0 {
                break;
            }
            idx += right as usize;
        }
        total
    }

    fn rescale_context(&mut self, ctx: usize, minimum: u16) {
        let symbols = self.symbols[ctx].symbols;
        let total = if symbols != 0 {
            self.rescale_symbol(ctx + symbols as usize)
        } else {
            0
        };
        let context = &mut self.symbols[ctx];
        context.total = total;
        context.escapes -= context.escapes >> 1;
        context.total = context
            .total
            .wrapping_add(context.escapes + 256 * minimum);
    }

    /// Find or create `value` in the context's tree, bumping its weight by
    /// `update`. Returns the symbol index plus the cumulative (under,
    /// count) pair; count stays at `minimum` when the symbol was absent.
    fn context_encode(
        &mut self,
        next: &mut usize,
        ctx: usize,
        value: u8,
        update: u8,
        minimum: u16,
    ) -> (usize, u16, u16) {
        let mut under = value as u16 * minimum;
        let count = minimum;

        if self.symbols[ctx].symbols == 0 {
            let idx = self.create_symbol(next, value, update);
            self.symbols[ctx].symbols = (idx - ctx) as u16;
            return (idx, under, count);
        }

        let mut node = ctx + self.symbols[ctx].symbols as usize;
        loop {
            let current = self.symbols[node];
            if value < current.value {
                self.symbols[node].under = current.under.wrapping_add(update as u16);
                if current.left != 0 {
                    node += current.left as usize;
                    continue;
                }
                let idx = self.create_symbol(next, value, update);
                self.symbols[node].left = (idx - node) as u16;
                return (idx, under, count);
            } else if value > current.value {
                under = under.wrapping_add(current.under);
                if current.right != 0 {
                    node += current.right as usize;
                    continue;
                }
                let idx = self.create_symbol(next, value, update);
                self.symbols[node].right = (idx - node) as u16;
                return (idx, under, count);
            } else {
                let count = count.wrapping_add(current.count as u16);
                under = under.wrapping_add(current.under - current.count as u16);
                self.symbols[node].under = current.under.wrapping_add(update as u16);
                self.symbols[node].count = current.count.wrapping_add(update);
                return (node, under, count);
            }
        }
    }

    /// Locate the symbol covering `code` in a subcontext without creating
    /// anything. `None` means the stream is corrupt.
    fn context_try_decode(
        &mut self,
        ctx: usize,
        code: u16,
        update: u8,
    ) -> Option<(usize, u8, u16, u16)> {
        let mut under: u16 = 0;
        if self.symbols[ctx].symbols == 0 {
            return None;
        }
        let mut node = ctx + self.symbols[ctx].symbols as usize;
        loop {
            let current = self.symbols[node];
            let after = under.wrapping_add(current.under);
            let before = current.count as u16;
            if code >= after {
                under = under.wrapping_add(current.under);
                if current.right != 0 {
                    node += current.right as usize;
                    continue;
                }
                return None;
            } else if code < after.wrapping_sub(before) {
                self.symbols[node].under = current.under.wrapping_add(update as u16);
                if current.left != 0 {
                    node += current.left as usize;
                    continue;
                }
                return None;
            } else {
                let count = current.count as u16;
                self.symbols[node].under = current.under.wrapping_add(update as u16);
                self.symbols[node].count = current.count.wrapping_add(update);
                return Some((node, current.value, after.wrapping_sub(before), count));
            }
        }
    }

    /// Locate or create the symbol covering `code` in the root context,
    /// where every byte value carries an implicit `minimum` weight.
    fn context_root_decode(
        &mut self,
        next: &mut usize,
        ctx: usize,
        code: u16,
        update: u8,
        minimum: u16,
    ) -> (usize, u8, u16, u16) {
        let mut under: u16 = 0;
        let count = minimum;

        if self.symbols[ctx].symbols == 0 {
            let value = (code / minimum) as u8;
            under = code - code % minimum;
            let idx = self.create_symbol(next, value, update);
            self.symbols[ctx].symbols = (idx - ctx) as u16;
            return (idx, value, under, count);
        }

        let mut node = ctx + self.symbols[ctx].symbols as usize;
        loop {
            let current = self.symbols[node];
            let after = under
                .wrapping_add(current.under)
                .wrapping_add((current.value as u16 + 1).wrapping_mul(minimum));
            let before = (current.count as u16).wrapping_add(minimum);
            if code >= after {
                under = under.wrapping_add(current.under);
                if current.right != 0 {
                    node += current.right as usize;
                    continue;
                }
                let value =
                    (current.value as u16).wrapping_add(1).wrapping_add((code - after) / minimum)
                        as u8;
                let under = code - (code - after) % minimum;
                let idx = self.create_symbol(next, value, update);
                self.symbols[node].right = (idx - node) as u16;
                return (idx, value, under, count);
            } else if code < after.wrapping_sub(before) {
                self.symbols[node].under = current.under.wrapping_add(update as u16);
                if current.left != 0 {
                    node += current.left as usize;
                    continue;
                }
                let gap = after.wrapping_sub(before).wrapping_sub(code).wrapping_sub(1);
                let value = (current.value as u16).wrapping_sub(1).wrapping_sub(gap / minimum) as u8;
                let under = code - gap % minimum;
                let idx = self.create_symbol(next, value, update);
                self.symbols[node].left = (idx - node) as u16;
                return (idx, value, under, count);
            } else {
                let count = count.wrapping_add(current.count as u16);
                self.symbols[node].under = current.under.wrapping_add(update as u16);
                self.symbols[node].count = current.count.wrapping_add(update);
                return (node, current.value, after.wrapping_sub(before), count);
            }
        }
    }

    fn link_parent(&mut self, slot: ParentSlot, value: u16, predicted: &mut u16) {
        match slot {
            ParentSlot::Predicted => *predicted = value,
            ParentSlot::Symbol(idx) => self.symbols[idx].parent = value,
        }
    }
}

struct RangeEncoder<'a> {
    out: &'a mut [u8],
    pos: usize,
    low: u32,
    range: u32,
}

impl<'a> RangeEncoder<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self {
            out,
            pos: 0,
            low: 0,
            range: !0,
        }
    }

    #[inline]
    fn output(&mut self, byte: u8) -> bool {
        if self.pos >= self.out.len() {
            return false;
        }
        self.out[self.pos] = byte;
        self.pos += 1;
        true
    }

    fn encode(&mut self, under: u32, count: u32, total: u32) -> bool {
        self.range /= total;
        self.low = self.low.wrapping_add(under.wrapping_mul(self.range));
        self.range = self.range.wrapping_mul(count);
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= RANGE_TOP {
                if self.range >= RANGE_BOTTOM {
                    return true;
                }
                self.range = self.low.wrapping_neg() & (RANGE_BOTTOM - 1);
            }
            if !self.output((self.low >> 24) as u8) {
                return false;
            }
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    fn flush(&mut self) -> bool {
        while self.low != 0 {
            if !self.output((self.low >> 24) as u8) {
                return false;
            }
            self.low <<= 8;
        }
        true
    }
}

struct RangeDecoder<'a> {
    input: &'a [u8],
    pos: usize,
    low: u32,
    code: u32,
    range: u32,
}

impl<'a> RangeDecoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        let mut decoder = Self {
            input,
            pos: 0,
            low: 0,
            code: 0,
            range: !0,
        };
        for shift in [24, 16, 8, 0] {
            if decoder.pos < decoder.input.len() {
                decoder.code |= (decoder.input[decoder.pos] as u32) << shift;
                decoder.pos += 1;
            }
        }
        decoder
    }

    #[inline]
    fn read(&mut self, total: u32) -> u16 {
        self.range /= total;
        (self.code.wrapping_sub(self.low) / self.range) as u16
    }

    fn decode(&mut self, under: u32, count: u32) {
        self.low = self.low.wrapping_add(under.wrapping_mul(self.range));
        self.range = self.range.wrapping_mul(count);
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= RANGE_TOP {
                if self.range >= RANGE_BOTTOM {
                    return;
                }
                self.range = self.low.wrapping_neg() & (RANGE_BOTTOM - 1);
            }
            self.code <<= 8;
            if self.pos < self.input.len() {
                self.code |= self.input[self.pos] as u32;
                self.pos += 1;
            }
            self.range <<= 8;
            self.low <<= 8;
        }
    }
}

impl Compressor for RangeCoder {
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> usize {
        if input.is_empty() {
            return 0;
        }

        let mut next = 0usize;
        let root = self.create_context(&mut next, CONTEXT_ESCAPE_MINIMUM, CONTEXT_SYMBOL_MINIMUM);
        let mut predicted: u16 = 0;
        let mut order: usize = 0;
        let mut encoder = RangeEncoder::new(output);

        for &value in input {
            let mut parent_slot = ParentSlot::Predicted;
            let mut matched = false;

            let mut subcontext = predicted as usize;
            while subcontext != root {
                let (symbol, under, count) = self.context_encode(
                    &mut next,
                    subcontext,
                    value,
                    SUBCONTEXT_SYMBOL_DELTA,
                    0,
                );
                self.link_parent(parent_slot, symbol as u16, &mut predicted);
                parent_slot = ParentSlot::Symbol(symbol);

                let total = self.symbols[subcontext].total;
                if count > 0 {
                    let escapes = self.symbols[subcontext].escapes;
                    if !encoder.encode(
                        escapes as u32 + under as u32,
                        count as u32,
                        total as u32,
                    ) {
                        return 0;
                    }
                } else {
                    let escapes = self.symbols[subcontext].escapes;
                    if escapes > 0 && escapes < total {
                        if !encoder.encode(0, escapes as u32, total as u32) {
                            return 0;
                        }
                    }
                    self.symbols[subcontext].escapes += SUBCONTEXT_ESCAPE_DELTA;
                    self.symbols[subcontext].total += SUBCONTEXT_ESCAPE_DELTA;
                }
                self.symbols[subcontext].total += SUBCONTEXT_SYMBOL_DELTA as u16;
                if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA as u16
                    || self.symbols[subcontext].total > TOTAL_RESCALE_LIMIT
                {
                    self.rescale_context(subcontext, 0);
                }
                if count > 0 {
                    matched = true;
                    break;
                }

                subcontext = self.symbols[subcontext].parent as usize;
            }

            if !matched {
                let (symbol, under, count) = self.context_encode(
                    &mut next,
                    root,
                    value,
                    CONTEXT_SYMBOL_DELTA,
                    CONTEXT_SYMBOL_MINIMUM,
                );
                self.link_parent(parent_slot, symbol as u16, &mut predicted);

                let total = self.symbols[root].total;
                let escapes = self.symbols[root].escapes;
                if !encoder.encode(escapes as u32 + under as u32, count as u32, total as u32) {
                    return 0;
                }
                self.symbols[root].total += CONTEXT_SYMBOL_DELTA as u16;
                if count > 0xFF - 2 * CONTEXT_SYMBOL_DELTA as u16 + CONTEXT_SYMBOL_MINIMUM
                    || self.symbols[root].total > TOTAL_RESCALE_LIMIT
                {
                    self.rescale_context(root, CONTEXT_SYMBOL_MINIMUM);
                }
            }

            if order >= SUBCONTEXT_ORDER {
                predicted = self.symbols[predicted as usize].parent;
            } else {
                order += 1;
            }

            if next >= SYMBOL_POOL_SIZE - SUBCONTEXT_ORDER {
                next = 0;
                self.create_context(&mut next, CONTEXT_ESCAPE_MINIMUM, CONTEXT_SYMBOL_MINIMUM);
                predicted = 0;
                order = 0;
            }
        }

        if !encoder.flush() {
            return 0;
        }
        encoder.pos
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> usize {
        if input.is_empty() {
            return 0;
        }

        let mut next = 0usize;
        let root = self.create_context(&mut next, CONTEXT_ESCAPE_MINIMUM, CONTEXT_SYMBOL_MINIMUM);
        let mut predicted: u16 = 0;
        let mut order: usize = 0;
        let mut decoder = RangeDecoder::new(input);
        let mut produced = 0usize;

        loop {
            let mut parent_slot = ParentSlot::Predicted;
            let value;
            let bottom;
            let matched_context;

            let mut subcontext = predicted as usize;
            loop {
                if subcontext == root {
                    let total = self.symbols[root].total;
                    let escapes = self.symbols[root].escapes;
                    let code = decoder.read(total as u32);
                    if code < escapes {
                        decoder.decode(0, escapes as u32);
                        return produced;
                    }
                    let code = code - escapes;
                    let (symbol, decoded, under, count) = self.context_root_decode(
                        &mut next,
                        root,
                        code,
                        CONTEXT_SYMBOL_DELTA,
                        CONTEXT_SYMBOL_MINIMUM,
                    );
                    decoder.decode(escapes as u32 + under as u32, count as u32);
                    self.symbols[root].total += CONTEXT_SYMBOL_DELTA as u16;
                    if count > 0xFF - 2 * CONTEXT_SYMBOL_DELTA as u16 + CONTEXT_SYMBOL_MINIMUM
                        || self.symbols[root].total > TOTAL_RESCALE_LIMIT
                    {
                        self.rescale_context(root, CONTEXT_SYMBOL_MINIMUM);
                    }
                    value = decoded;
                    bottom = symbol;
                    matched_context = root;
                    break;
                }

                let escapes = self.symbols[subcontext].escapes;
                let total = self.symbols[subcontext].total;
                if escapes == 0 || escapes >= total {
                    subcontext = self.symbols[subcontext].parent as usize;
                    continue;
                }
                let code = decoder.read(total as u32);
                if code < escapes {
                    decoder.decode(0, escapes as u32);
                    subcontext = self.symbols[subcontext].parent as usize;
                    continue;
                }
                let code = code - escapes;
                let Some((symbol, decoded, under, count)) =
                    self.context_try_decode(subcontext, code, SUBCONTEXT_SYMBOL_DELTA)
                else {
                    return 0;
                };
                decoder.decode(escapes as u32 + under as u32, count as u32);
                self.symbols[subcontext].total += SUBCONTEXT_SYMBOL_DELTA as u16;
                if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA as u16
                    || self.symbols[subcontext].total > TOTAL_RESCALE_LIMIT
                {
                    self.rescale_context(subcontext, 0);
                }
                value = decoded;
                bottom = symbol;
                matched_context = subcontext;
                break;
            }

            // Mirror the encoder's model updates in the contexts that
            // escaped before the match.
            let mut patch = predicted as usize;
            while patch != matched_context {
                let (symbol, _, count) =
                    self.context_encode(&mut next, patch, value, SUBCONTEXT_SYMBOL_DELTA, 0);
                self.link_parent(parent_slot, symbol as u16, &mut predicted);
                parent_slot = ParentSlot::Symbol(symbol);

                if count == 0 {
                    self.symbols[patch].escapes += SUBCONTEXT_ESCAPE_DELTA;
                    self.symbols[patch].total += SUBCONTEXT_ESCAPE_DELTA;
                }
                self.symbols[patch].total += SUBCONTEXT_SYMBOL_DELTA as u16;
                if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA as u16
                    || self.symbols[patch].total > TOTAL_RESCALE_LIMIT
                {
                    self.rescale_context(patch, 0);
                }

                patch = self.symbols[patch].parent as usize;
            }
            self.link_parent(parent_slot, bottom as u16, &mut predicted);

            if produced >= output.len() {
                return 0;
            }
            output[produced] = value;
            produced += 1;

            if order >= SUBCONTEXT_ORDER {
                predicted = self.symbols[predicted as usize].parent;
            } else {
                order += 1;
            }

            if next >= SYMBOL_POOL_SIZE - SUBCONTEXT_ORDER {
                next = 0;
                self.create_context(&mut next, CONTEXT_ESCAPE_MINIMUM, CONTEXT_SYMBOL_MINIMUM);
                predicted = 0;
                order = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) {
        let mut coder = RangeCoder::new();
        let mut compressed = vec![0u8; data.len() * 2 + 64];
        let compressed_len = coder.compress(data, &mut compressed);
        assert!(compressed_len > 0, "compression produced nothing");

        let mut restored = vec![0u8; data.len()];
        let restored_len = coder.decompress(&compressed[..compressed_len], &mut restored);
        assert_eq!(restored_len, data.len());
        assert_eq!(&restored[..], data);
    }

    #[test]
    fn roundtrip_short_strings() {
        roundtrip(b"a");
        roundtrip(b"ab");
        roundtrip(b"hello world");
        roundtrip(&[0u8; 17]);
        roundtrip(&[0xFFu8; 33]);
    }

    #[test]
    fn roundtrip_repetitive_block() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        roundtrip(&data);
    }

    #[test]
    fn roundtrip_mixed_block() {
        let data: Vec<u8> = (0..2048u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        roundtrip(&data);
    }

    #[test]
    fn roundtrip_text() {
        let text = "the quick brown fox jumps over the lazy dog. "
            .repeat(40)
            .into_bytes();
        roundtrip(&text);
    }

    #[test]
    fn repetitive_data_shrinks() {
        let mut coder = RangeCoder::new();
        let data = vec![b'x'; 1200];
        let mut out = vec![0u8; 1200];
        let len = coder.compress(&data, &mut out);
        assert!(len > 0 && len < data.len());
    }

    #[test]
    fn output_limit_reports_failure() {
        let mut coder = RangeCoder::new();
        let data: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(48271) >> 7) as u8)
            .collect();
        let mut tiny = [0u8; 4];
        assert_eq!(coder.compress(&data, &mut tiny), 0);
    }

    #[test]
    fn coder_is_reusable_across_packets() {
        let mut coder = RangeCoder::new();
        for round in 0..8 {
            let data: Vec<u8> = (0..512u32).map(|i| ((i + round) % 11) as u8).collect();
            let mut compressed = vec![0u8; 1024];
            let n = coder.compress(&data, &mut compressed);
            assert!(n > 0);
            let mut restored = vec![0u8; data.len()];
            assert_eq!(coder.decompress(&compressed[..n], &mut restored), data.len());
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        let mut coder = RangeCoder::new();
        let mut out = [0u8; 16];
        assert_eq!(coder.compress(&[], &mut out), 0);
        assert_eq!(coder.decompress(&[], &mut out), 0);
    }
}

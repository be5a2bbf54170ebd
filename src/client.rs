//! Light-client verification of the header stream.
//!
//! The client downloads the raw 48-byte header records, reconstructs the
//! chained block ids, and checks timestamps and proof-of-work targets
//! across both difficulty regimes. Two retargeting quirks around the
//! hardfork heights are consensus-critical and reproduced exactly as the
//! chain executed them.

use num_bigint::{BigInt, BigUint, Sign};
use num_rational::Ratio;
use num_traits::{Signed, Zero};

use crate::error::Result;
use crate::types::{block_id, BlockId, BlockNonce, Hash, HEADER_LEN};
use crate::{errcorrupt, errinput};

/// A 256-bit proof-of-work target, compared and stored big-endian. Lower
/// targets mean higher difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// The easiest possible target.
    pub fn root_depth() -> Target {
        Target([0xFF; 32])
    }

    fn int(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    fn rat(&self) -> Ratio<BigInt> {
        Ratio::from_integer(BigInt::from_biguint(Sign::Plus, self.int()))
    }

    fn from_int(i: &BigUint) -> Target {
        if i.bits() > 256 {
            return Self::root_depth();
        }
        let bytes = i.to_bytes_be();
        let mut t = [0u8; 32];
        t[32 - bytes.len()..].copy_from_slice(&bytes);
        Target(t)
    }

    fn from_rat(r: &Ratio<BigInt>) -> Target {
        if r.numer().is_negative() {
            return Target([0u8; 32]);
        }
        let i = r.to_integer().to_biguint().unwrap_or_default();
        Self::from_int(&i)
    }

    /// Integer difficulty: the root depth divided by this target.
    pub fn difficulty(&self) -> BigUint {
        let i = self.int();
        if i.is_zero() {
            return Self::root_depth().int();
        }
        Self::root_depth().int() / i
    }

    /// Multiplies the difficulty by num/den, which divides the target.
    pub fn mul_difficulty(&self, num: i64, den: i64) -> Target {
        let inverse = Ratio::new(BigInt::from(den), BigInt::from(num));
        Self::from_rat(&(self.rat() * inverse))
    }

    /// Target whose difficulty is the sum of both difficulties.
    pub fn add_difficulties(&self, other: &Target) -> Target {
        if self.int().is_zero() || other.int().is_zero() {
            return Target([0u8; 32]);
        }
        let sum = self.rat().recip() + other.rat().recip();
        Self::from_rat(&sum.recip())
    }

    /// Whether a block id satisfies this target.
    pub fn met_by(&self, id: &Hash) -> bool {
        id[..] <= self.0[..]
    }
}

/// Consensus parameters of the chain being verified. Injectable so tests
/// can run cheap chains; the default is the production network.
#[derive(Debug, Clone)]
pub struct ChainConstants {
    /// Desired seconds between blocks.
    pub block_frequency: u64,
    /// Number of past timestamps whose median bounds a child timestamp.
    pub median_timestamp_window: usize,
    /// Seconds a timestamp may run ahead of the verifier's clock.
    pub future_threshold: u64,
    pub genesis_timestamp: u64,
    /// Blocks per retargeting window of the original algorithm.
    pub target_window: u64,
    /// Clamp on one windowed adjustment, as num/den ratios.
    pub max_adjustment_up: (i64, i64),
    pub max_adjustment_down: (i64, i64),
    /// Height at which the EWMA difficulty algorithm activates.
    pub oak_hardfork_block: u64,
    /// Height at which its delta computation was corrected.
    pub oak_hardfork_fix_block: u64,
    pub oak_decay_num: i64,
    pub oak_decay_denom: i64,
    /// Clamp on the derived block time, as a factor of block_frequency.
    pub oak_max_block_shift: i64,
    /// Per-block clamp on the target, as num/den ratios.
    pub oak_max_rise: (i64, i64),
    pub oak_max_drop: (i64, i64),
    pub root_target: Target,
    /// When set, the first header's id must match.
    pub genesis_id: Option<BlockId>,
}

impl Default for ChainConstants {
    fn default() -> Self {
        let mut root_target = [0u8; 32];
        root_target[4] = 32;
        Self {
            block_frequency: 600,
            median_timestamp_window: 11,
            future_threshold: 3 * 60 * 60,
            genesis_timestamp: 1_433_600_000,
            target_window: 1000,
            max_adjustment_up: (25, 10),
            max_adjustment_down: (10, 25),
            oak_hardfork_block: 135_000,
            oak_hardfork_fix_block: 139_000,
            oak_decay_num: 995,
            oak_decay_denom: 1000,
            oak_max_block_shift: 3,
            oak_max_rise: (1004, 1000),
            oak_max_drop: (1000, 1004),
            root_target: Target(root_target),
            genesis_id: None,
        }
    }
}

/// One parsed header with its reconstructed chain position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub nonce: BlockNonce,
    pub timestamp: u64,
    pub merkle_root: Hash,
    pub parent_id: BlockId,
    pub id: BlockId,
}

/// The parsed header stream; ids chain from a zero parent at genesis.
pub struct HeaderSet {
    infos: Vec<BlockInfo>,
}

impl HeaderSet {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % HEADER_LEN != 0 {
            return Err(errcorrupt!("bad length of headers: {}", bytes.len()));
        }
        let mut infos = Vec::with_capacity(bytes.len() / HEADER_LEN);
        let mut parent_id = BlockId::default();
        for chunk in bytes.chunks_exact(HEADER_LEN) {
            let nonce: BlockNonce = chunk[..8].try_into().expect("nonce is 8 bytes");
            let timestamp = u64::from_le_bytes(chunk[8..16].try_into().expect("timestamp is 8 bytes"));
            let merkle_root: Hash = chunk[16..48].try_into().expect("root is 32 bytes");
            let id = block_id(&parent_id, &nonce, timestamp, &merkle_root);
            infos.push(BlockInfo { nonce, timestamp, merkle_root, parent_id, id });
            parent_id = id;
        }
        Ok(Self { infos })
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn get(&self, height: usize) -> &BlockInfo {
        &self.infos[height]
    }
}

/// The expected target for every height, computed exactly the way the
/// chain did, including its two hardfork quirks.
pub fn block_targets(headers: &HeaderSet, c: &ChainConstants) -> Vec<Target> {
    let n = headers.len();
    let mut targets = vec![c.root_target; n];
    if n == 0 {
        return targets;
    }
    // Totals "before" the genesis block; the genesis parent timestamp is
    // the genesis timestamp itself.
    let mut parent_timestamp = c.genesis_timestamp;
    let mut parent_height: u64 = 0;
    let mut total_time: i64 = 0;
    let mut total_target = Target::root_depth();
    for i in 0..n - 1 {
        targets[i + 1] = child_target(
            headers,
            &targets[i],
            total_time,
            &total_target,
            parent_height,
            parent_timestamp,
            c,
        );
        let (new_time, new_target) = block_totals(
            i as u64,
            total_time,
            parent_timestamp,
            headers.get(i).timestamp,
            &total_target,
            &targets[i],
            c,
        );
        total_time = new_time;
        total_target = new_target;
        parent_timestamp = headers.get(i).timestamp;
        parent_height = i as u64;
    }
    targets
}

#[allow(clippy::too_many_arguments)]
fn child_target(
    headers: &HeaderSet,
    current_target: &Target,
    parent_total_time: i64,
    parent_total_target: &Target,
    parent_height: u64,
    parent_timestamp: u64,
    c: &ChainConstants,
) -> Target {
    if parent_height < c.oak_hardfork_block {
        old_target_adjustment(headers, parent_height + 1, current_target, c)
    } else {
        oak_adjustment(parent_total_time, parent_total_target, current_target, parent_height, parent_timestamp, c)
    }
}

/// Original regime: every half window, scale the target by the ratio of
/// observed to expected elapsed time, clamped.
fn old_target_adjustment(
    headers: &HeaderSet,
    current_height: u64,
    current_target: &Target,
    c: &ChainConstants,
) -> Target {
    if current_height % (c.target_window / 2) != 0 {
        return *current_target;
    }
    let window = current_height.min(c.target_window);
    let oldest = headers.get((current_height - window) as usize).timestamp;
    let newest = headers.get(current_height as usize).timestamp;
    let time_passed = newest as i64 - oldest as i64;
    let expected = (c.block_frequency * window) as i64;
    let mut adjustment = Ratio::new(BigInt::from(time_passed), BigInt::from(expected));

    let up = Ratio::new(BigInt::from(c.max_adjustment_up.0), BigInt::from(c.max_adjustment_up.1));
    let down =
        Ratio::new(BigInt::from(c.max_adjustment_down.0), BigInt::from(c.max_adjustment_down.1));
    if adjustment > up {
        adjustment = up;
    } else if adjustment < down {
        adjustment = down;
    }
    Target::from_rat(&(current_target.rat() * adjustment))
}

/// Post-hardfork regime: an EWMA over (total time, total target) yields a
/// visible hashrate, multiplied by a clamped block time into a per-block
/// target, itself clamped relative to the previous target.
fn oak_adjustment(
    parent_total_time: i64,
    parent_total_target: &Target,
    current_target: &Target,
    parent_height: u64,
    parent_timestamp: u64,
    c: &ChainConstants,
) -> Target {
    // Quirk: before the fix height the delta is measured against the
    // decayed total time rather than the parent timestamp, so the shifter
    // always sees blocks arriving too fast. Consensus-critical.
    let delta: i64 = if parent_height < c.oak_hardfork_fix_block {
        (c.block_frequency * parent_height) as i64 - parent_total_time
    } else {
        (c.block_frequency * parent_height + c.genesis_timestamp) as i64 - parent_timestamp as i64
    };
    let mut square = delta * delta;
    if delta < 0 {
        square = -square;
    }
    let shift = square / 10_000_000; // a 10e3-second delta shifts 10 seconds
    let mut target_block_time = c.block_frequency as i64 + shift;
    if target_block_time < c.block_frequency as i64 / c.oak_max_block_shift {
        target_block_time = c.block_frequency as i64 / c.oak_max_block_shift;
    }
    if target_block_time > c.block_frequency as i64 * c.oak_max_block_shift {
        target_block_time = c.block_frequency as i64 * c.oak_max_block_shift;
    }

    let total_time = parent_total_time.max(1);
    let mut visible_hashrate = parent_total_target.difficulty() / BigUint::from(total_time as u64);
    if visible_hashrate.is_zero() {
        visible_hashrate += 1u32;
    }
    if target_block_time == 0 {
        target_block_time = 1;
    }

    let max_new_target = current_target.mul_difficulty(c.oak_max_rise.0, c.oak_max_rise.1);
    let min_new_target = current_target.mul_difficulty(c.oak_max_drop.0, c.oak_max_drop.1);
    let denominator = visible_hashrate * BigUint::from(target_block_time as u64);
    let mut new_target = Target::from_rat(&Ratio::new(
        BigInt::from_biguint(Sign::Plus, Target::root_depth().int()),
        BigInt::from_biguint(Sign::Plus, denominator),
    ));
    if new_target < max_new_target {
        new_target = max_new_target;
    }
    if new_target > min_new_target {
        new_target = min_new_target;
    }
    new_target
}

/// Decays the running totals and folds in the current block.
fn block_totals(
    current_height: u64,
    prev_total_time: i64,
    parent_timestamp: u64,
    current_timestamp: u64,
    prev_total_target: &Target,
    target_of_current_block: &Target,
    c: &ChainConstants,
) -> (i64, Target) {
    let mut prev_total_time = prev_total_time;
    // Quirk: one block before the hardfork the uncompressed expected time
    // overwrites the decayed total, causing a brief difficulty drop the
    // chain actually executed. Consensus-critical.
    if current_height + 1 == c.oak_hardfork_block {
        prev_total_time = (c.block_frequency * current_height) as i64;
    }
    let new_total_time = prev_total_time * c.oak_decay_num / c.oak_decay_denom
        + (current_timestamp as i64 - parent_timestamp as i64);
    let new_total_target = prev_total_target
        .mul_difficulty(c.oak_decay_num, c.oak_decay_denom)
        .add_difficulties(target_of_current_block);
    (new_total_time, new_total_target)
}

/// Earliest timestamp a child of `height` may carry: the median of the
/// window of timestamps ending at `height`, repeating the genesis
/// timestamp when the chain is shorter than the window.
fn minimum_valid_child_timestamp(
    headers: &HeaderSet,
    height: usize,
    c: &ChainConstants,
) -> Result<u64> {
    let window = c.median_timestamp_window;
    let mut times = Vec::with_capacity(window);
    times.push(headers.get(height).timestamp);
    let mut parent_id = headers.get(height).parent_id;
    for i in 1..window {
        if parent_id == BlockId::default() {
            times.push(times[i - 1]);
            continue;
        }
        if i > height {
            return Err(errcorrupt!(
                "headers are not sorted properly or the first header is not genesis"
            ));
        }
        let info = headers.get(height - i);
        parent_id = info.parent_id;
        times.push(info.timestamp);
    }
    times.sort_unstable();
    Ok(times[times.len() / 2])
}

fn verify_header(
    info: &BlockInfo,
    height: usize,
    min_timestamp: u64,
    target: &Target,
    current_timestamp: u64,
    c: &ChainConstants,
) -> Result<()> {
    if !target.met_by(&info.id) {
        return Err(errcorrupt!("block {height} is unsolved"));
    }
    if info.timestamp < min_timestamp {
        return Err(errcorrupt!("block {height} has a too-early timestamp"));
    }
    if info.timestamp > current_timestamp + c.future_threshold {
        return Err(errcorrupt!("block {height} is too far in the future"));
    }
    Ok(())
}

/// Verifies the whole header chain: genesis identity (when configured),
/// proof-of-work against the expected target at every height, and the
/// timestamp rules. The genesis header itself is exempt from the work
/// check.
pub fn verify_block_headers(
    headers: &HeaderSet,
    c: &ChainConstants,
    current_timestamp: u64,
) -> Result<()> {
    if headers.is_empty() {
        return Err(errinput!("number of block headers is 0"));
    }
    let targets = block_targets(headers, c);
    let first = headers.get(0);
    if let Some(genesis_id) = c.genesis_id {
        if first.id != genesis_id {
            return Err(errcorrupt!("bad genesis block"));
        }
    }
    let mut min_timestamp = first.timestamp;
    for height in 1..headers.len() {
        verify_header(headers.get(height), height, min_timestamp, &targets[height], current_timestamp, c)?;
        min_timestamp = minimum_valid_child_timestamp(headers, height, c)?;
    }
    Ok(())
}

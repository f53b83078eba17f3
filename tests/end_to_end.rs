//! Whole-engine scenarios that need a real multi-generation superblock
//! history or a real file to be meaningful, exercised entirely through the
//! public surface so they double as usage examples.

use cbe::collab::ref_impls::{AesGcmSivCipher, FileBackend, MemBackend, Sha256Hasher};
use cbe::types::Vba;
use cbe::{Block, CbeError, Config, Library, Request};

type MemEngine = Library<MemBackend, AesGcmSivCipher, Sha256Hasher>;
type FileEngine = Library<FileBackend, AesGcmSivCipher, Sha256Hasher>;

fn run_until_quiescent<B: cbe::BlockBackend, C: cbe::BlockCipher, H: cbe::BlockHasher>(lib: &mut Library<B, C, H>, now: &mut u64) {
    loop {
        let progress = lib.execute(*now).unwrap();
        *now += 1;
        if !progress {
            break;
        }
    }
}

fn block_with(byte: u8) -> Block {
    let mut b = Block::zeroed();
    b.as_mut_slice()[0] = byte;
    b
}

/// Submits a one-block write and drives it to quiescence. `Some(success)` if
/// the request reached completion; `None` if it is still stuck waiting on a
/// free-tree allocation (the caller decides whether that counts as failure).
fn write_completed(lib: &mut MemEngine, now: &mut u64, vba: u64, tag: u64, byte: u8) -> Option<bool> {
    lib.submit_client_request(Request::write(Vba(vba), 1, tag), Some(vec![block_with(byte)])).unwrap();
    run_until_quiescent(lib, now);
    if lib.peek_completed_client_request() == Some(tag) {
        Some(lib.drop_completed_client_request(tag).unwrap().0)
    } else {
        None
    }
}

fn sync_and_wait(lib: &mut MemEngine, now: &mut u64, tag: u64) {
    lib.submit_client_request(Request::sync(tag), None).unwrap();
    run_until_quiescent(lib, now);
    lib.drop_completed_client_request(tag).unwrap();
}

/// A write whose free-tree allocation is stuck (no reusable PBA found) never
/// reaches completion on its own; the host must explicitly ask for a retry
/// (spec §4.4 step 3). Retrying while nothing has changed leaves it stuck.
fn assert_stays_stalled(lib: &mut MemEngine, now: &mut u64, attempts: u32) {
    for _ in 0..attempts {
        assert!(lib.retry_allocation().is_ok());
        run_until_quiescent(lib, now);
    }
}

/// A PBA freed by overwriting a sealed generation's data must stay
/// unreusable for as long as that generation's snapshot is still retained in
/// the superblock's ring (spec §8 scenario 3, invariant 3) -- demonstrated
/// here immediately after the freeing write, while generation 1 is still the
/// most recent retained snapshot.
#[test]
fn snapshot_isolation_blocks_reuse_while_the_owning_snapshot_is_retained() {
    let backend = MemBackend::new(512);
    let cipher = AesGcmSivCipher::new([3u8; 32]);
    let hasher = Sha256Hasher;
    let mut lib: MemEngine = Library::format(backend, cipher, hasher, Config::default(), 64, 1, 64, 4, 0).unwrap();
    let mut now = 1u64;

    // Generation 1: write VBA 0, consuming two of the four pool PBAs (a leaf
    // and the root), then seal.
    assert_eq!(write_completed(&mut lib, &mut now, 0, 1, 0xA1), Some(true));
    sync_and_wait(&mut lib, &mut now, 2);

    // Generation 2: overwrite VBA 0, consuming the remaining two PBAs and
    // freeing generation 1's leaf/root. Generation 1's snapshot is still in
    // the ring, so those two freed PBAs must stay protected.
    assert_eq!(write_completed(&mut lib, &mut now, 0, 3, 0xB2), Some(true));

    // The pool is now fully accounted for: two PBAs in active use by
    // generation 2, two freed-but-retained by generation 1. A write to a
    // third, distinct VBA has nothing left to allocate and must stall.
    assert_eq!(
        write_completed(&mut lib, &mut now, 1, 4, 0xC3),
        None,
        "generation 1's freed pbas must not be reusable while its snapshot is retained"
    );
    assert_stays_stalled(&mut lib, &mut now, 3);
}

/// Once a freeing generation is sealed AND the snapshot that depended on the
/// freed PBAs has rotated out of the superblock's retention ring, those PBAs
/// become reusable again (spec §8 scenario 3, the other half of invariant 3).
#[test]
fn snapshot_isolation_releases_reuse_once_the_owning_snapshot_rotates_out() {
    let backend = MemBackend::new(512);
    let cipher = AesGcmSivCipher::new([6u8; 32]);
    let hasher = Sha256Hasher;
    let mut lib: MemEngine = Library::format(backend, cipher, hasher, Config::default(), 64, 1, 64, 4, 0).unwrap();
    let mut now = 1u64;

    assert_eq!(write_completed(&mut lib, &mut now, 0, 1, 0xA1), Some(true));
    sync_and_wait(&mut lib, &mut now, 2);

    assert_eq!(write_completed(&mut lib, &mut now, 0, 3, 0xB2), Some(true));
    sync_and_wait(&mut lib, &mut now, 4);

    // Roll the ring all the way around with plain no-op seals (no new
    // writes, so the pool never risks stalling) until generation 1's slot is
    // overwritten by a later generation.
    for i in 0..cbe::types::NUM_SNAPSHOTS as u64 {
        sync_and_wait(&mut lib, &mut now, 100 + i);
    }

    // Generation 1's snapshot has rotated out of the ring; its freed PBAs
    // are reusable, so a write to a third, distinct VBA now succeeds.
    assert_eq!(
        write_completed(&mut lib, &mut now, 1, 5, 0xC3),
        Some(true),
        "once generation 1's snapshot has rotated out of the ring its pbas become reusable"
    );
}

/// If the backend is "restarted" after a write's path has been durably
/// written but before Sync-SB has published the new superblock slot, the
/// reopened engine must recover to the previous superblock and show no
/// trace of the unsealed write (spec §8 scenario 5).
#[test]
fn crash_before_seal_recovers_to_the_last_sealed_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.cbe");
    let block_count = 512u64;

    {
        let backend = FileBackend::open(&path, block_count).unwrap();
        let cipher = AesGcmSivCipher::new([4u8; 32]);
        let hasher = Sha256Hasher;
        let mut lib: FileEngine = Library::format(backend, cipher, hasher, Config::default(), 64, 1, 64, 16, 0).unwrap();
        let mut now = 1u64;

        lib.submit_client_request(Request::write(Vba(0), 1, 1), Some(vec![block_with(0xAA)])).unwrap();
        run_until_quiescent(&mut lib, &mut now);
        lib.drop_completed_client_request(1).unwrap();

        lib.submit_client_request(Request::sync(2), None).unwrap();
        run_until_quiescent(&mut lib, &mut now);
        lib.drop_completed_client_request(2).unwrap();

        // A second write lands on disk (its leaf and path nodes are
        // durable), but we deliberately never sync it: the superblock slot
        // on disk still names generation 1's root.
        lib.submit_client_request(Request::write(Vba(0), 1, 3), Some(vec![block_with(0xBB)])).unwrap();
        run_until_quiescent(&mut lib, &mut now);
        lib.drop_completed_client_request(3).unwrap();
        // engine and its FileBackend drop here without ever calling sync again
    }

    let backend = FileBackend::open(&path, block_count).unwrap();
    let cipher = AesGcmSivCipher::new([4u8; 32]);
    let hasher = Sha256Hasher;
    let mut lib: FileEngine = Library::open(backend, cipher, hasher, Config::default(), 0).unwrap();
    let mut now = 1u64;

    lib.submit_client_request(Request::read(Vba(0), 1, 10), None).unwrap();
    run_until_quiescent(&mut lib, &mut now);
    let (success, data) = lib.drop_completed_client_request(10).unwrap();
    assert!(success);
    assert_eq!(
        data[0].as_ref().unwrap().as_slice()[0],
        0xAA,
        "recovery must land on the last sealed generation, not the unsealed write"
    );
}

/// Basic sanity check on the public error boundary: an out-of-range read is
/// rejected before a primitive is ever queued.
#[test]
fn out_of_range_read_is_rejected_without_queuing_a_primitive() {
    let backend = MemBackend::new(512);
    let cipher = AesGcmSivCipher::new([5u8; 32]);
    let hasher = Sha256Hasher;
    let mut lib: MemEngine = Library::format(backend, cipher, hasher, Config::default(), 64, 1, 64, 4, 0).unwrap();

    let max_vba = lib.max_vba();
    let err = lib.submit_client_request(Request::read(Vba(max_vba.0 + 1), 1, 1), None).unwrap_err();
    assert!(matches!(err, CbeError::OutOfRange { .. }));
    assert_eq!(lib.peek_completed_client_request(), None);
}

mod common;

use std::sync::Arc;

use common::{frame, pool, MockNic, MockRegisters};
use morpheus_dataplane::descriptor::e1000::{E1000TxDescriptor, TXD_CMD_EOP, TXD_CMD_RS};
use morpheus_dataplane::{
    BufferPool, DataplaneError, ReclaimMode, Ref, RefChain, RingState, TxConfig, TxQueue,
};

type Queue = TxQueue<E1000TxDescriptor, MockRegisters>;

fn setup(pool: Arc<BufferPool>, config: TxConfig) -> (Queue, MockNic) {
    let nic = MockNic::new(pool.heap().clone());
    let queue = TxQueue::new(pool, nic.regs.clone(), config).unwrap();
    queue.arm().unwrap();
    (queue, nic)
}

fn packets(pool: &BufferPool, n: usize) -> Vec<Ref> {
    let mut refs = pool.allocate_refs(n).unwrap();
    for (i, r) in refs.iter_mut().enumerate() {
        pool.write_data(r, &frame(60 + i, i as u8)).unwrap();
    }
    refs
}

#[test]
fn test_backpressure_accepts_prefix() {
    let (tx, nic) = setup(pool(1536, None), TxConfig::new(4));
    let refs = packets(tx.pool(), 5);

    assert_eq!(
        tx.submit(&refs),
        Err(DataplaneError::RingFull { accepted: 3 })
    );
    assert_eq!(nic.state().tail, 3);
    assert_eq!(tx.ring_status().outstanding, 3);
    assert_eq!(tx.free_slots(), 0);

    for slot in 0..3u16 {
        assert_eq!(nic.tx_payload(slot), frame(60 + slot as usize, slot as u8));
    }
    let last = nic.tx_descriptor(2);
    assert_eq!(last.cmd & (TXD_CMD_EOP | TXD_CMD_RS), TXD_CMD_EOP | TXD_CMD_RS);

    // Ring still full: nothing more accepted.
    assert_eq!(
        tx.submit(&refs[3..]),
        Err(DataplaneError::RingFull { accepted: 0 })
    );
    tx.pool().free_refs(&refs[3..], false).unwrap();
}

#[test]
fn test_reclaim_descriptor_done() {
    let (tx, nic) = setup(pool(1536, None), TxConfig::new(8));
    let refs = packets(tx.pool(), 3);
    let free_start = tx.pool().stats().free_buffers;
    tx.submit(&refs[..2]).unwrap();
    tx.submit(&refs[2..]).unwrap();

    // Only the first batch is reported.
    nic.complete_tx(1);
    assert_eq!(tx.reclaim(), Ok(2));
    assert_eq!(tx.ring_status().outstanding, 1);
    assert_eq!(tx.ring_status().state, RingState::Running);

    nic.complete_tx(2);
    assert_eq!(tx.reclaim(), Ok(1));
    assert_eq!(tx.reclaim(), Ok(0));
    assert_eq!(tx.pool().stats().free_buffers, free_start + 3);
    assert_eq!(tx.stats().completed, 3);
}

#[test]
fn test_reclaim_head_writeback() {
    let mut config = TxConfig::new(8);
    config.reclaim = ReclaimMode::HeadWriteback;
    let (tx, nic) = setup(pool(1536, None), config);
    assert!(nic.state().writeback.is_some());

    let refs = packets(tx.pool(), 3);
    tx.submit(&refs).unwrap();

    let mut done = Vec::new();
    assert_eq!(tx.reclaim_into(&mut done), Ok(0));

    nic.write_back_head(2);
    assert_eq!(tx.reclaim_into(&mut done), Ok(2));
    assert_eq!(done, refs[..2]);

    nic.write_back_head(3);
    assert_eq!(tx.reclaim_into(&mut done), Ok(1));
    assert_eq!(done, refs);
    tx.pool().free_refs(&done, true).unwrap();
}

#[test]
fn test_chained_packet_round_trip() {
    let (tx, nic) = setup(pool(1536, None), TxConfig::new(8));
    let refs = packets(tx.pool(), 3);
    let free_before = tx.pool().stats().free_buffers;

    let mut chain = RefChain::new();
    for r in &refs {
        chain.append(tx.pool().heap(), *r).unwrap();
    }
    let head = chain.done().unwrap();
    assert_eq!(tx.submit(&[head]), Ok(1));

    for slot in 0..3u16 {
        let desc = nic.tx_descriptor(slot);
        assert_eq!(desc.cmd & TXD_CMD_EOP != 0, slot == 2);
        assert_eq!(nic.tx_payload(slot), frame(60 + slot as usize, slot as u8));
    }

    nic.complete_tx(2);
    assert_eq!(tx.reclaim(), Ok(1));
    assert_eq!(tx.pool().stats().free_buffers, free_before + 3);
}

#[test]
fn test_wraps_around_ring() {
    let (tx, nic) = setup(pool(1536, None), TxConfig::new(4));
    for round in 0..5 {
        let refs = packets(tx.pool(), 2);
        assert_eq!(tx.submit(&refs), Ok(2));
        let last = (round * 2 + 1) % 4;
        nic.complete_tx(last as u16);
        assert_eq!(tx.reclaim(), Ok(2));
        assert_eq!(tx.ring_status().outstanding, 0);
    }
    assert_eq!(tx.stats().packets, 10);
}

#[test]
fn test_teardown_frees_unsent() {
    let mut config = TxConfig::new(8);
    config.reclaim = ReclaimMode::HeadWriteback;
    let (tx, _nic) = setup(pool(1536, None), config);
    let refs = packets(tx.pool(), 2);
    tx.submit(&refs).unwrap();

    assert_eq!(tx.teardown(), Err(DataplaneError::InvalidState));
    tx.stop().unwrap();
    tx.teardown().unwrap();

    let stats = tx.pool().stats();
    assert_eq!(stats.free_buffers, stats.total_buffers);
    tx.pool().teardown().unwrap();
    assert_eq!(tx.pool().heap().stats().used, 0);
}

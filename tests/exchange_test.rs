// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! End-to-end exchange scenarios over the in-process transport.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use arrow::array::{Array, Int32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use chunkflow::common::ids::SlotId;
use chunkflow::exec::chunk::Chunk;
use chunkflow::exec::chunk::serde::serialize_chunk;
use chunkflow::exec::expr::{SlotRef, SortKey};
use chunkflow::exec::operators::exchange_sink::{
    ExchangeSinkOperatorFactory, ExchangeSinkParams, PartitionType,
};
use chunkflow::exec::operators::exchange_source::ExchangeSourceOperatorFactory;
use chunkflow::exec::pipeline::operator::{Operator, ProcessorOperator};
use chunkflow::runtime::data_stream_recvr::DataStreamRecvrParams;
use chunkflow::runtime::runtime_state::RuntimeState;
use chunkflow::service::exchange_sender::ExchangeSendQueue;
use chunkflow::service::proto::{CompressionTypePb, PTransmitChunkParams, PUniqueId};
use chunkflow::service::transport::{Destination, ExchangeTransport, LocalExchangeTransport};
use chunkflow::{DataStreamMgr, UniqueId};

const DEST_NODE_ID: i32 = 2;

fn make_chunk(values: &[i32]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
        .expect("record batch");
    Chunk::from_batch_with_slots(batch, &[SlotId::new(1)]).expect("chunk")
}

fn chunk_values(chunk: &Chunk) -> Vec<i32> {
    let arr = chunk
        .columns()
        .first()
        .expect("first column")
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column");
    (0..arr.len()).map(|i| arr.value(i)).collect()
}

fn make_request(
    finst_id: UniqueId,
    sender_id: i32,
    be_number: i32,
    sequence: i64,
    values: &[i32],
) -> PTransmitChunkParams {
    let chunk = make_chunk(values);
    let pb = serialize_chunk(
        &chunk,
        CompressionTypePb::NoCompression,
        &mut Vec::new(),
        true,
    )
    .expect("serialize");
    PTransmitChunkParams {
        finst_id: Some(PUniqueId::from(finst_id)),
        node_id: DEST_NODE_ID,
        sender_id,
        be_number,
        sequence,
        eos: false,
        chunks: vec![pb],
    }
}

fn eos_request(
    finst_id: UniqueId,
    sender_id: i32,
    be_number: i32,
    sequence: i64,
) -> PTransmitChunkParams {
    PTransmitChunkParams {
        finst_id: Some(PUniqueId::from(finst_id)),
        node_id: DEST_NODE_ID,
        sender_id,
        be_number,
        sequence,
        eos: true,
        chunks: Vec::new(),
    }
}

/// Send requests one at a time, waiting for each completion like a channel
/// with one in-flight request. A retained ack blocks the sender here.
fn send_all(
    transport: &Arc<LocalExchangeTransport>,
    dest: &Destination,
    requests: Vec<PTransmitChunkParams>,
) {
    for request in requests {
        let (tx, rx) = mpsc::channel();
        transport.transmit_chunk(
            dest,
            request,
            Box::new(move |result| {
                tx.send(result).expect("completion channel");
            }),
        );
        rx.recv()
            .expect("completion signal")
            .expect("transmit success");
    }
}

fn recvr_params(finst_id: UniqueId, num_senders: usize) -> DataStreamRecvrParams {
    let mut params = DataStreamRecvrParams::new(finst_id, DEST_NODE_ID, num_senders);
    params.total_buffer_limit = usize::MAX >> 1;
    params
}

#[test]
fn unordered_multiplex_consumes_everything_under_backpressure() {
    let mgr = DataStreamMgr::new();
    let transport = LocalExchangeTransport::new(Arc::clone(&mgr));
    let finst_id = UniqueId::new(1, 1);

    const NUM_SENDERS: i32 = 3;
    const CHUNKS_PER_SENDER: i64 = 100;
    let chunk_rows: Vec<i32> = (0..256).collect(); // ~1 KiB of data per chunk

    let probe = make_request(finst_id, 0, 0, 0, &chunk_rows);
    let request_bytes: i64 = probe.chunks.iter().map(|c| c.data.len() as i64).sum();
    let buffer_limit = (request_bytes * 50) as usize;

    let mut params = recvr_params(finst_id, NUM_SENDERS as usize);
    params.total_buffer_limit = buffer_limit;
    let recvr = mgr.create_recvr(params);

    let mut senders = Vec::new();
    for sender in 0..NUM_SENDERS {
        let transport = Arc::clone(&transport);
        senders.push(std::thread::spawn(move || {
            let dest = Destination {
                fragment_instance_id: finst_id,
                address: "local".to_string(),
            };
            let mut requests = Vec::new();
            for seq in 0..CHUNKS_PER_SENDER {
                requests.push(make_request(
                    finst_id,
                    0,
                    sender,
                    seq,
                    &(0..256).map(|v| v + sender).collect::<Vec<i32>>(),
                ));
            }
            requests.push(eos_request(finst_id, 0, sender, CHUNKS_PER_SENDER));
            send_all(&transport, &dest, requests);
        }));
    }

    let mut consumed = 0usize;
    while let Some(chunk) = recvr.get_chunk().expect("get_chunk") {
        assert_eq!(chunk.num_rows(), 256);
        consumed += 1;
        // Soft bound: the limit plus at most one admitted batch per sender.
        assert!(
            recvr.buffered_bytes() <= buffer_limit as i64 + NUM_SENDERS as i64 * request_bytes,
            "buffered bytes exceed the soft bound: {}",
            recvr.buffered_bytes()
        );
    }
    assert_eq!(consumed, (NUM_SENDERS as i64 * CHUNKS_PER_SENDER) as usize);
    assert!(recvr.is_finished());

    // Every sender completed every request: the held acks all fired.
    for sender in senders {
        sender.join().expect("sender thread");
    }
    assert_eq!(recvr.buffered_bytes(), 0);
    recvr.close();
}

#[test]
fn merged_sorted_streams_produce_a_total_order() {
    let mgr = DataStreamMgr::new();
    let transport = LocalExchangeTransport::new(Arc::clone(&mgr));
    let finst_id = UniqueId::new(1, 2);

    let mut params = recvr_params(finst_id, 2);
    params.is_merging = true;
    let recvr = mgr.create_recvr(params);
    recvr
        .create_merger(vec![SortKey::asc(SlotRef::new(SlotId::new(1)))], 4096)
        .expect("create merger");

    let inputs: [&[i32]; 2] = [&[1, 3, 5, 7], &[2, 4, 6, 8]];
    let mut senders = Vec::new();
    for (sender, values) in inputs.iter().enumerate() {
        let transport = Arc::clone(&transport);
        let values = values.to_vec();
        senders.push(std::thread::spawn(move || {
            let dest = Destination {
                fragment_instance_id: finst_id,
                address: "local".to_string(),
            };
            let requests = vec![
                make_request(finst_id, sender as i32, sender as i32, 0, &values),
                eos_request(finst_id, sender as i32, sender as i32, 1),
            ];
            send_all(&transport, &dest, requests);
        }));
    }

    let mut merged = Vec::new();
    while let Some(chunk) = recvr.get_next().expect("merged get_next") {
        merged.extend(chunk_values(&chunk));
    }
    assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    for sender in senders {
        sender.join().expect("sender thread");
    }
    recvr.close();
}

#[test]
fn keep_order_receiver_reassembles_out_of_order_packets() {
    let mgr = DataStreamMgr::new();
    let transport = LocalExchangeTransport::new(Arc::clone(&mgr));
    let finst_id = UniqueId::new(1, 3);

    let mut params = recvr_params(finst_id, 1);
    params.is_pipeline = true;
    params.keep_order = true;
    let recvr = mgr.create_recvr(params);

    let dest = Destination {
        fragment_instance_id: finst_id,
        address: "local".to_string(),
    };
    // Wall-clock send order: sequences 2, 0, 1 from backend 7.
    send_all(
        &transport,
        &dest,
        vec![make_request(finst_id, 0, 7, 2, &[30])],
    );
    send_all(
        &transport,
        &dest,
        vec![make_request(finst_id, 0, 7, 0, &[10])],
    );
    send_all(
        &transport,
        &dest,
        vec![
            make_request(finst_id, 0, 7, 1, &[20]),
            eos_request(finst_id, 0, 7, 3),
        ],
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut delivered = Vec::new();
    loop {
        match recvr.get_chunk_for_pipeline().expect("pipeline get") {
            Some(chunk) => delivered.extend(chunk_values(&chunk)),
            None => {
                if recvr.is_finished() {
                    break;
                }
                assert!(Instant::now() < deadline, "receiver did not finish");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
    assert_eq!(delivered, vec![10, 20, 30]);
    recvr.close();
}

#[test]
fn cancel_mid_stream_releases_all_held_acks() {
    let mgr = DataStreamMgr::new();
    let transport = LocalExchangeTransport::new(Arc::clone(&mgr));
    let finst_id = UniqueId::new(1, 4);

    const CHUNKS_PER_SENDER: i64 = 30;

    let mut params = recvr_params(finst_id, 2);
    params.is_pipeline = true;
    params.total_buffer_limit = 1; // every request holds its ack
    let recvr = mgr.create_recvr(params);

    let mut senders = Vec::new();
    for sender in 0..2 {
        let transport = Arc::clone(&transport);
        senders.push(std::thread::spawn(move || {
            let dest = Destination {
                fragment_instance_id: finst_id,
                address: "local".to_string(),
            };
            let mut requests = Vec::new();
            for seq in 0..CHUNKS_PER_SENDER {
                requests.push(make_request(finst_id, 0, sender, seq, &[sender, seq as i32]));
            }
            requests.push(eos_request(finst_id, 0, sender, CHUNKS_PER_SENDER));
            send_all(&transport, &dest, requests);
        }));
    }

    for _ in 0..10 {
        recvr.get_chunk().expect("get_chunk").expect("chunk");
    }
    recvr.cancel_stream();

    let err = recvr.get_chunk().expect_err("cancelled stream");
    assert!(err.is_cancelled());

    // Every held ack was released: both senders run to completion instead of
    // hanging on a retained completion.
    for sender in senders {
        sender.join().expect("sender thread");
    }
    recvr.close();
}

#[test]
fn corrupt_payload_fails_the_sender_and_surfaces_to_the_consumer() {
    let mgr = DataStreamMgr::new();
    let transport = LocalExchangeTransport::new(Arc::clone(&mgr));
    let finst_id = UniqueId::new(1, 5);

    let recvr = mgr.create_recvr(recvr_params(finst_id, 1));
    let dest = Destination {
        fragment_instance_id: finst_id,
        address: "local".to_string(),
    };

    let mut request = make_request(finst_id, 0, 1, 0, &[1, 2, 3]);
    let mut mangled = request.chunks[0].data.to_vec();
    mangled.truncate(mangled.len() / 2);
    request.chunks[0].uncompressed_size = mangled.len() as i64;
    request.chunks[0].serialized_size = mangled.len() as i64;
    request.chunks[0].data = mangled.into();

    let (tx, rx) = mpsc::channel();
    transport.transmit_chunk(
        &dest,
        request,
        Box::new(move |result| {
            tx.send(result).expect("completion channel");
        }),
    );
    let err = rx
        .recv()
        .expect("completion signal")
        .expect_err("corrupt request must fail");
    assert!(matches!(err, chunkflow::Status::Corruption(_)), "err={err:?}");

    let err = recvr.get_chunk().expect_err("stream is poisoned");
    assert!(matches!(err, chunkflow::Status::Corruption(_)), "err={err:?}");
    recvr.close();
}

#[test]
fn broadcast_delivers_one_chunk_to_every_destination() {
    let mgr = DataStreamMgr::new();
    let transport = LocalExchangeTransport::new(Arc::clone(&mgr));

    const NUM_DESTS: usize = 4;
    let values: Vec<i32> = (0..2048).collect(); // ~8 KiB chunk

    let mut receivers = Vec::new();
    let mut destinations = Vec::new();
    for i in 0..NUM_DESTS {
        let finst_id = UniqueId::new(2, i as i64 + 1);
        let mut params = recvr_params(finst_id, 1);
        params.is_pipeline = true;
        receivers.push(mgr.create_recvr(params));
        destinations.push(Destination {
            fragment_instance_id: finst_id,
            address: format!("backend-{i}"),
        });
    }

    let send_queue = ExchangeSendQueue::new(transport);
    let factory = ExchangeSinkOperatorFactory::new(
        ExchangeSinkParams {
            part_type: PartitionType::Broadcast,
            destinations,
            dest_node_id: DEST_NODE_ID,
            sender_id: 0,
            be_number: 1,
            partition_exprs: vec![],
            compress_type: CompressionTypePb::Lz4,
            send_queue,
        },
        5,
    );
    let mut sink = factory.create();
    sink.prepare().expect("prepare");
    let state = RuntimeState::default();

    assert!(sink.need_input());
    sink.push_chunk(&state, make_chunk(&values)).expect("push");
    sink.set_finishing(&state).expect("finish");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !sink.is_finished() {
        assert!(Instant::now() < deadline, "sink did not drain");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(sink.close_status().is_none());

    for recvr in &receivers {
        let source_factory =
            ExchangeSourceOperatorFactory::new(Arc::clone(recvr), false, DEST_NODE_ID);
        let mut source = source_factory.create();
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(chunk) = source.pull_chunk(&state).expect("pull") {
                got.extend(chunk_values(&chunk));
            } else if source.is_finished() {
                break;
            } else {
                assert!(Instant::now() < deadline, "source did not finish");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(got, values);
        source.close().expect("close source");
    }
}

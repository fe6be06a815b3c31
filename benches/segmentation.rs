use std::sync::Arc;

use bacnet_tsm::app::{Apdu, ApplicationConfig, DeviceInfo, Pdu, SapEvent, Segmentation, StateMachineAccessPoint};
use bacnet_tsm::network::Address;
use bacnet_tsm::service::ConfirmedServiceChoice;
use bacnet_tsm::task::ManualClock;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn pair(max_apdu: u16) -> (StateMachineAccessPoint, StateMachineAccessPoint, Address, Address) {
    let clock = Arc::new(ManualClock::new());
    let client_address = Address::local_station(vec![10, 0, 0, 1, 0xBA, 0xC0]);
    let server_address = Address::local_station(vec![10, 0, 0, 2, 0xBA, 0xC0]);

    let config = ApplicationConfig::default()
        .with_segmentation(Segmentation::Both)
        .with_max_apdu_length(max_apdu)
        .with_max_segments(None)
        .with_window_size(16);
    let mut client = StateMachineAccessPoint::with_clock(config.clone(), clock.clone());
    let mut info = DeviceInfo::new(Some(2), Some(server_address.clone()));
    info.max_apdu_length_accepted = Some(max_apdu);
    info.segmentation_supported = Segmentation::Both;
    client.device_info_cache_mut().insert(info);
    let server = StateMachineAccessPoint::with_clock(config, clock);

    (client, server, client_address, server_address)
}

/// One confirmed request carrying `payload`, answered with a simple ack
fn round_trip(
    client: &mut StateMachineAccessPoint,
    server: &mut StateMachineAccessPoint,
    client_address: &Address,
    server_address: &Address,
    payload: &[u8],
) -> usize {
    let invoke_id = client.get_next_invoke_id(server_address).unwrap();
    let request = Apdu::confirmed_request(invoke_id, ConfirmedServiceChoice::WriteProperty, payload.to_vec());
    client
        .sap_indication(Pdu::outbound(server_address.clone(), request))
        .unwrap();

    let mut exchanged = 0;
    loop {
        let mut quiet = true;
        while let Some(event) = client.poll_event() {
            quiet = false;
            if let SapEvent::Transmit(pdu) = event {
                exchanged += 1;
                server
                    .confirmation(Pdu::inbound(client_address.clone(), pdu.apdu))
                    .unwrap();
            }
        }
        while let Some(event) = server.poll_event() {
            quiet = false;
            match event {
                SapEvent::Transmit(pdu) => {
                    exchanged += 1;
                    client
                        .confirmation(Pdu::inbound(server_address.clone(), pdu.apdu))
                        .unwrap();
                }
                SapEvent::Request(pdu) => {
                    let ack = Apdu::SimpleAck {
                        invoke_id: pdu.apdu.invoke_id().unwrap(),
                        service_choice: ConfirmedServiceChoice::WriteProperty as u8,
                    };
                    server
                        .sap_confirmation(Pdu::outbound(client_address.clone(), ack))
                        .unwrap();
                }
                SapEvent::Response(_) => {}
            }
        }
        if quiet {
            return exchanged;
        }
    }
}

fn segmented_request_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("segmented_request");
    for size in [400usize, 4_000, 40_000] {
        let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let (mut client, mut server, client_address, server_address) = pair(480);
            b.iter(|| {
                black_box(round_trip(
                    &mut client,
                    &mut server,
                    &client_address,
                    &server_address,
                    black_box(payload),
                ))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, segmented_request_benchmark);
criterion_main!(benches);

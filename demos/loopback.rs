//! Loopback Demo
//!
//! Runs a client and a server access point in a background thread, wired
//! together through in-memory queues, and sends them a few requests from the
//! main thread. Requests are large enough to be segmented in both directions.
//!
//! Run with `RUST_LOG=debug cargo run --example loopback` to watch the
//! transactions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bacnet_tsm::app::io::ApplicationIoController;
use bacnet_tsm::app::router::{ServiceReply, ServiceRouter};
use bacnet_tsm::app::{Apdu, ApplicationConfig, DeviceInfo, Pdu, SapEvent, Segmentation, StateMachineAccessPoint};
use bacnet_tsm::iocb::{Iocb, IocbState};
use bacnet_tsm::network::Address;
use bacnet_tsm::service::ConfirmedServiceChoice;
use bytes::Bytes;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("BACnet Transaction Loopback Demo");
    println!("================================\n");

    let client_address = Address::from_socket_addr("192.168.1.10:47808".parse()?);
    let server_address = Address::from_socket_addr("192.168.1.20:47808".parse()?);

    let config = ApplicationConfig::default()
        .with_segmentation(Segmentation::Both)
        .with_max_apdu_length(206)
        .with_max_segments(Some(16));
    let mut client = StateMachineAccessPoint::new(config.clone());
    let mut info = DeviceInfo::new(Some(1020), Some(server_address.clone()));
    info.max_apdu_length_accepted = Some(206);
    info.segmentation_supported = Segmentation::Both;
    client.device_info_cache_mut().insert(info);
    let mut server = StateMachineAccessPoint::new(config);

    let mut router = ServiceRouter::new();
    router.on_confirmed(ConfirmedServiceChoice::ReadProperty, |source, request| {
        println!("  server: ReadProperty from {} ({} bytes)", source, request.len());
        ServiceReply::ComplexAck(Bytes::from(request.repeat(4)))
    });

    let io = Arc::new(ApplicationIoController::new());
    let running = Arc::new(AtomicBool::new(true));

    let network = {
        let io = io.clone();
        let running = running.clone();
        let client_address = client_address.clone();
        let server_address = server_address.clone();
        thread::spawn(move || -> Result<(), bacnet_tsm::ApplicationError> {
            while running.load(Ordering::SeqCst) {
                io.process_outbox(&mut client);
                client.process_tasks()?;
                server.process_tasks()?;

                for event in io.handle_events(client.drain_events()) {
                    if let SapEvent::Transmit(pdu) = event {
                        server.confirmation(Pdu::inbound(client_address.clone(), pdu.apdu))?;
                    }
                }
                for event in server.drain_events() {
                    match event {
                        SapEvent::Transmit(pdu) => {
                            client.confirmation(Pdu::inbound(server_address.clone(), pdu.apdu))?
                        }
                        SapEvent::Request(pdu) => router.serve(&mut server, &pdu)?,
                        SapEvent::Response(pdu) => println!("  server: {:?}", pdu.apdu),
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
            println!("\nclient statistics: {:?}", client.statistics());
            println!("server statistics: {:?}", server.statistics());
            Ok(())
        })
    };

    for size in [16usize, 120, 600] {
        let request: Vec<u8> = (0..size).map(|i| i as u8).collect();
        let apdu = Apdu::confirmed_request(0, ConfirmedServiceChoice::ReadProperty, request);
        let iocb = Iocb::new(Pdu::outbound(server_address.clone(), apdu));
        iocb.set_timeout(Duration::from_secs(5));

        println!("client: ReadProperty with {} bytes", size);
        io.request_io(&iocb)?;
        match iocb.wait() {
            IocbState::Completed => {
                let reply = iocb.response().and_then(|pdu| pdu.apdu.service_data().cloned());
                println!(
                    "client: complex ack with {} bytes\n",
                    reply.map_or(0, |data| data.len())
                );
            }
            state => println!("client: request {} ({:?})\n", state, iocb.error()),
        }
    }

    running.store(false, Ordering::SeqCst);
    network
        .join()
        .map_err(|_| "network thread panicked")??;
    Ok(())
}

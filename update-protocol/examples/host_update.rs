use clap::{Parser, ValueEnum};
use crc::{Crc, CRC_32_ISCSI};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use update_protocol::{HostProtocolMessage, Update, COBS_MAX_MSG_SIZE, MAX_BLOCK_SIZE};

#[derive(Clone, Debug, PartialEq, ValueEnum)]
enum Command {
    State,
    ActiveBank,
    Abort,
    Update,
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long)]
    list_ports: bool,
    #[arg(short, long, default_value_t = String::from("/dev/ttyUSB0"))]
    port: String,
    #[arg(short, long, default_value_t = 460800)]
    baudrate: u32,
    #[arg(short, long, value_enum)]
    cmd: Option<Command>,
    /// Firmware image to send with `--cmd update`
    #[arg(short, long)]
    image: Option<PathBuf>,
    /// Raw signature block (64 byte `r || s`, or the 32 byte digest for `hash-sha256`)
    #[arg(short, long)]
    signature: Option<PathBuf>,
    #[arg(long, default_value_t = String::from("sig-sha256-ecdsa"))]
    signature_type: String,
}

/// Sends one frame and reads back one COBS frame into `rx`.
async fn exchange<'a>(
    serial: &mut SerialStream,
    msg: &HostProtocolMessage<'_>,
    rx: &'a mut [u8; COBS_MAX_MSG_SIZE],
    timeout: Duration,
) -> Result<Option<HostProtocolMessage<'a>>, Box<dyn Error>> {
    let mut tx = [0u8; COBS_MAX_MSG_SIZE];
    let frame = postcard::to_slice_cobs(msg, &mut tx)?;
    serial.write_all(frame).await?;
    serial.flush().await?;

    let mut len = 0;
    loop {
        let read = tokio::time::timeout(timeout, serial.read(&mut rx[len..])).await;
        match read {
            Ok(Ok(0)) | Err(_) => return Ok(None),
            Ok(Ok(n)) => {
                len += n;
                if rx[..len].contains(&0) || len == rx.len() {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(Some(postcard::from_bytes_cobs(&mut rx[..len])?))
}

async fn send_image(serial: &mut SerialStream, image: &[u8], signature_type: &str, signature: &[u8]) -> Result<(), Box<dyn Error>> {
    let mut rx = [0u8; COBS_MAX_MSG_SIZE];
    let begin = HostProtocolMessage::Update(Update::Begin {
        total_size: u32::try_from(image.len())?,
    });
    // Erasing a full bank takes a while
    match exchange(serial, &begin, &mut rx, Duration::from_secs(30)).await? {
        Some(HostProtocolMessage::Update(Update::AckBegin { bank })) => println!("Writing image to bank {bank}"),
        other => {
            println!("Begin refused: {other:?}");
            return Ok(());
        }
    }

    let crc = Crc::<u32>::new(&CRC_32_ISCSI);
    for (idx, chunk) in image.chunks(MAX_BLOCK_SIZE).enumerate() {
        let offset = u32::try_from(idx * MAX_BLOCK_SIZE)?;
        let block = HostProtocolMessage::Update(Update::WriteBlock { offset, data: chunk });
        match exchange(serial, &block, &mut rx, Duration::from_millis(500)).await? {
            Some(HostProtocolMessage::Update(Update::AckWithOffsetCrc { offset: acked, crc: acked_crc })) => {
                if acked != offset || acked_crc != crc.checksum(chunk) {
                    println!("CRC mismatch at offset {offset:#x}");
                    return Ok(());
                }
                log::debug!("ACK offset {acked:#x}");
            }
            Some(HostProtocolMessage::Update(Update::NackWithOffset { offset, reason })) => {
                println!("Block at {offset:#x} refused: {reason:?}");
                return Ok(());
            }
            other => {
                println!("Unexpected answer: {other:?}");
                return Ok(());
            }
        }
    }

    let finish = HostProtocolMessage::Update(Update::Finish { signature_type, signature });
    match exchange(serial, &finish, &mut rx, Duration::from_secs(5)).await? {
        // Device resets into the new bank without answering
        None => println!("Image accepted, device restarting"),
        Some(ans) => println!("Image refused: {ans:?}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let args = Args::parse();

    if args.list_ports {
        let ports = tokio_serial::available_ports()?;
        println!("List of available serial ports:");
        for port in ports {
            println!("- {}", port.port_name);
        }
        return Ok(());
    }

    let Some(cmd) = args.cmd else {
        println!("Choose a command to be send.");
        return Ok(());
    };

    let mut serial = tokio_serial::new(&args.port, args.baudrate).open_native_async()?;
    let mut rx = [0u8; COBS_MAX_MSG_SIZE];
    let timeout = Duration::from_secs(2);
    match cmd {
        Command::State => {
            let ans = exchange(&mut serial, &HostProtocolMessage::GetState, &mut rx, timeout).await?;
            println!("<{ans:?}");
        }
        Command::ActiveBank => {
            let msg = HostProtocolMessage::Update(Update::GetActiveBank);
            let ans = exchange(&mut serial, &msg, &mut rx, timeout).await?;
            println!("<{ans:?}");
        }
        Command::Abort => {
            let msg = HostProtocolMessage::Update(Update::Abort);
            let ans = exchange(&mut serial, &msg, &mut rx, timeout).await?;
            println!("<{ans:?}");
        }
        Command::Update => {
            let (Some(image), Some(signature)) = (args.image, args.signature) else {
                println!("--image and --signature are required for an update");
                return Ok(());
            };
            let image = std::fs::read(image)?;
            let signature = std::fs::read(signature)?;
            send_image(&mut serial, &image, &args.signature_type, &signature).await?;
        }
    }

    Ok(())
}

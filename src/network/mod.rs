//! Network plumbing: UDP socket setup and control-message framing

pub mod control;
pub mod udp;

pub use control::{
    control_reader, control_transport, control_writer, decode_message, encode_message, read_json, read_message,
    send_body, write_json, ControlTransport,
};
pub use udp::create_socket;

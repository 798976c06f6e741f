pub mod icmp;
pub mod ip_family;
pub mod packet_conn;
pub mod raw_icmp_socket;

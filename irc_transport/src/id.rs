use serde::{Serialize,Deserialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Define a sequential object ID type, and a generator for it.
///
/// The last element of the ID tuple is the serial; any leading elements are
/// fixed for a given generator (e.g. the client a connection belongs to).
macro_rules! sequential_id {
    ($id:ident, $generator:ident ( $( $arg:ident : $argtype:ty ),* )) => {
        #[derive(PartialEq,Eq,PartialOrd,Ord,Hash,Debug,Clone,Copy,Serialize,Deserialize)]
        pub struct $id($( pub $argtype, )* pub i64);

        #[derive(Debug)]
        pub struct $generator
        {
            $( $arg: $argtype, )*
            next: AtomicI64,
        }

        impl $generator
        {
            pub fn new($( $arg: $argtype, )* start: i64) -> Self
            {
                Self { $( $arg, )* next: AtomicI64::new(start) }
            }

            pub fn next(&self) -> $id
            {
                $id($( self.$arg, )* self.next.fetch_add(1, Ordering::Relaxed))
            }
        }
    };
}

sequential_id!(ClientId, ClientIdGenerator());
sequential_id!(ConnectionId, ConnectionIdGenerator(client: ClientId));
sequential_id!(ExchangeId, ExchangeIdGenerator(client: ClientId));

impl ConnectionId
{
    pub fn client(&self) -> ClientId { self.0 }
}

impl ExchangeId
{
    pub fn client(&self) -> ClientId { self.0 }
}

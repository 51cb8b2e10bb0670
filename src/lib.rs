pub mod adapters {
    pub mod fs;
    pub mod memory;
    pub mod store;
    pub mod supabase;
}

pub mod cli {
    pub mod interface;
}

pub mod core {
    pub mod evaluate;
    pub mod job;
    pub mod model;
    pub mod pipeline;
    pub mod preprocess;
    pub mod publish;
    pub mod registry;
    pub mod train;
    pub mod worker;
}

pub mod utils {
    pub mod lib;
}

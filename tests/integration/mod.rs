mod add_pipeline;
mod replication;
mod sorted_pagination;
mod test_utils;
mod verify_repair;

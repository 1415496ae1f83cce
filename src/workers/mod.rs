pub mod payment_status_poller;

//! Linux I2C demo.
//!
//! Reads the DHT20 every two seconds and prints the values, the way the
//! sensor usually gets polled from a Raspberry Pi or similar board.

use std::{env, process};

use dht20_driver::{DHT20, SENSOR_ADDRESS};
use embedded_hal::delay::DelayNs;
use linux_embedded_hal as hal;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        println!("usage: {} /dev/i2c-N", args[0]);
        process::exit(1);
    }

    let Ok(i2c) = hal::I2cdev::new(&args[1]) else {
        eprintln!("Couldn't open I2C device");
        return;
    };

    let mut delay = hal::Delay;
    let Ok(mut dht20) = DHT20::new(i2c, SENSOR_ADDRESS, &mut delay) else {
        eprintln!("Couldn't bring up the dht20");
        return;
    };

    loop {
        match dht20.read_data(&mut delay) {
            Ok(reading) => println!(
                "relative humidity={0:.2}%; temperature={1:.2}C",
                reading.humidity, reading.temperature
            ),
            Err(e) => eprintln!("error reading dht20: {e:?}"),
        }

        delay.delay_ms(2000);
    }
}

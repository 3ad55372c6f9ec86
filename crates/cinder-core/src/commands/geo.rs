//! Geo commands, encoded on the sorted set: each member's score is its
//! 64-bit geohash code.

use std::sync::Arc;

use bytes::Bytes;

use super::{aof_line, key_of, parse_f64, read_first_key, rollback_zset_members, write_first_key};
use crate::db::Database;
use crate::entity::DataEntity;
use crate::geohash;
use crate::registry::{register, Table, UndoFn, FLAG_READ_ONLY, FLAG_WRITE};
use crate::sorted_set::SortedSet;
use cinder_protocol::{CmdLine, Frame};

pub fn register_all(table: &mut Table) {
    register(table, "geoadd", exec_geoadd, Some(write_first_key), Some(undo_geoadd as UndoFn), -5, FLAG_WRITE);
    register(table, "geopos", exec_geopos, Some(read_first_key), None, -2, FLAG_READ_ONLY);
    register(table, "geodist", exec_geodist, Some(read_first_key), None, -4, FLAG_READ_ONLY);
    register(table, "geohash", exec_geohash, Some(read_first_key), None, -3, FLAG_READ_ONLY);
}

fn undo_geoadd(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    let members: Vec<String> = args[1..].chunks(3).filter(|c| c.len() == 3).map(|c| key_of(&c[2])).collect();
    rollback_zset_members(db, &key, &members)
}

fn member_score(db: &Arc<Database>, key: &str, member: &str) -> Result<Option<f64>, Frame> {
    match db.with_entity(key, |e| e.as_zset().map(|z| z.score(member))) {
        None => Ok(None),
        Some(Ok(s)) => Ok(s),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

// GEOADD key longitude latitude member [lng lat member ...]
fn exec_geoadd(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    if args[1..].len() % 3 != 0 {
        return Frame::arg_num_error("geoadd");
    }
    let key = key_of(&args[0]);

    let mut entries = Vec::with_capacity(args[1..].len() / 3);
    for chunk in args[1..].chunks(3) {
        let lng = match parse_f64(&chunk[0]) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let lat = match parse_f64(&chunk[1]) {
            Ok(v) => v,
            Err(e) => return e,
        };
        if !(geohash::LONGITUDE_RANGE.0..=geohash::LONGITUDE_RANGE.1).contains(&lng)
            || !(geohash::LATITUDE_RANGE.0..=geohash::LATITUDE_RANGE.1).contains(&lat)
        {
            return Frame::error(format!(
                "ERR invalid longitude,latitude pair {lng:.6},{lat:.6}"
            ));
        }
        entries.push((geohash::encode(lat, lng) as f64, key_of(&chunk[2])));
    }

    if let Some(Err(wrong)) = db.with_entity(&key, |e| e.as_zset().map(|_| ())) {
        return Frame::error(wrong.to_string());
    }
    let added = db.upsert_entity_with(
        &key,
        || DataEntity::SortedSet(SortedSet::new()),
        |entity| {
            let zset = entity.as_zset_mut().expect("checked zset type");
            entries
                .iter()
                .filter(|(score, member)| zset.add(member.clone(), *score))
                .count()
        },
    );
    db.add_aof(aof_line("GEOADD", args));
    Frame::Integer(added as i64)
}

// GEOPOS key member [member ...]
fn exec_geopos(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let mut out = Vec::with_capacity(args.len() - 1);
    for member_arg in &args[1..] {
        let member = key_of(member_arg);
        match member_score(db, &key, &member) {
            Ok(Some(score)) => {
                let (lat, lng) = geohash::decode(score as u64);
                out.push(Frame::Array(vec![
                    Frame::bulk(format!("{lng:.17}").into_bytes()),
                    Frame::bulk(format!("{lat:.17}").into_bytes()),
                ]));
            }
            Ok(None) => out.push(Frame::NullArray),
            Err(e) => return e,
        }
    }
    Frame::Array(out)
}

// GEODIST key member1 member2 [unit]
fn exec_geodist(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let unit = if args.len() > 3 {
        match String::from_utf8_lossy(&args[3]).to_ascii_lowercase().as_str() {
            "m" => 1.0,
            "km" => 1000.0,
            _ => return Frame::error("ERR unsupported unit provided. please use m, km"),
        }
    } else {
        1.0
    };

    let a = match member_score(db, &key, &key_of(&args[1])) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let b = match member_score(db, &key, &key_of(&args[2])) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match (a, b) {
        (Some(sa), Some(sb)) => {
            let (lat1, lng1) = geohash::decode(sa as u64);
            let (lat2, lng2) = geohash::decode(sb as u64);
            let dist = geohash::distance_m(lat1, lng1, lat2, lng2) / unit;
            Frame::bulk(format!("{dist:.4}").into_bytes())
        }
        _ => Frame::Null,
    }
}

// GEOHASH key member [member ...]
fn exec_geohash(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let mut out = Vec::with_capacity(args.len() - 1);
    for member_arg in &args[1..] {
        let member = key_of(member_arg);
        match member_score(db, &key, &member) {
            Ok(Some(score)) => {
                out.push(Frame::bulk(geohash::to_base32(score as u64).into_bytes()));
            }
            Ok(None) => out.push(Frame::Null),
            Err(e) => return e,
        }
    }
    Frame::Array(out)
}

#[cfg(test)]
mod tests {
    use super::super::test_db;
    use crate::registry::exec_normal;
    use cinder_protocol::{cmdline, Frame};

    #[test]
    fn geoadd_counts_new_members() {
        let db = test_db();
        assert_eq!(
            exec_normal(
                &db,
                &cmdline(["GEOADD", "g", "2.2945", "48.8584", "paris", "151.2153", "-33.8568", "sydney"])
            ),
            Frame::Integer(2)
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["GEOADD", "g", "2.2945", "48.8584", "paris"])),
            Frame::Integer(0)
        );
    }

    #[test]
    fn geoadd_rejects_out_of_range() {
        let db = test_db();
        let reply = exec_normal(&db, &cmdline(["GEOADD", "g", "200", "10", "bad"]));
        assert!(reply.is_error());
    }

    #[test]
    fn geopos_round_trips_coordinates() {
        let db = test_db();
        exec_normal(&db, &cmdline(["GEOADD", "g", "2.2945", "48.8584", "paris"]));
        let reply = exec_normal(&db, &cmdline(["GEOPOS", "g", "paris", "ghost"]));
        let Frame::Array(items) = reply else {
            panic!("expected array")
        };
        let Frame::Array(pair) = &items[0] else {
            panic!("expected coordinate pair")
        };
        let Frame::Bulk(lng) = &pair[0] else {
            panic!("expected bulk lng")
        };
        let lng: f64 = String::from_utf8_lossy(lng).parse().unwrap();
        assert!((lng - 2.2945).abs() < 1e-5);
        assert_eq!(items[1], Frame::NullArray);
    }

    #[test]
    fn geodist_km() {
        let db = test_db();
        exec_normal(&db, &cmdline(["GEOADD", "g", "2.2945", "48.8584", "paris"]));
        exec_normal(&db, &cmdline(["GEOADD", "g", "-0.1246", "51.5007", "london"]));
        let reply = exec_normal(&db, &cmdline(["GEODIST", "g", "paris", "london", "km"]));
        let Frame::Bulk(b) = reply else {
            panic!("expected bulk")
        };
        let km: f64 = String::from_utf8_lossy(&b).parse().unwrap();
        assert!((km - 344.0).abs() < 10.0, "got {km}");
    }

    #[test]
    fn geodist_missing_member_is_null() {
        let db = test_db();
        exec_normal(&db, &cmdline(["GEOADD", "g", "2.2945", "48.8584", "paris"]));
        assert_eq!(
            exec_normal(&db, &cmdline(["GEODIST", "g", "paris", "ghost"])),
            Frame::Null
        );
    }

    #[test]
    fn geohash_renders_base32() {
        let db = test_db();
        exec_normal(&db, &cmdline(["GEOADD", "g", "0", "51.4769", "greenwich"]));
        let reply = exec_normal(&db, &cmdline(["GEOHASH", "g", "greenwich"]));
        let Frame::Array(items) = reply else {
            panic!("expected array")
        };
        let Frame::Bulk(b) = &items[0] else {
            panic!("expected bulk")
        };
        assert_eq!(b.len(), 11);
    }
}

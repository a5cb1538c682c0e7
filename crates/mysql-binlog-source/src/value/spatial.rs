//! MySQL geometry values: a 4-byte little-endian SRID followed by WKB.

use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde_json::{json, Value as JsonValue};

/// Decode a MySQL geometry into GeoJSON text.
pub fn mysql_geometry_to_geojson(bytes: &[u8]) -> Result<String, String> {
    if bytes.len() < 4 {
        return Err(format!("geometry of {} bytes has no SRID", bytes.len()));
    }
    let mut reader = WkbReader {
        buf: &bytes[4..],
        pos: 0,
    };
    let geometry = reader.read_geometry(0)?;
    if reader.pos != reader.buf.len() {
        return Err(format!(
            "{} trailing bytes after geometry",
            reader.buf.len() - reader.pos
        ));
    }
    Ok(geojson(&geometry).to_string())
}

/// Nesting limit for geometry collections.
const MAX_DEPTH: usize = 32;

struct WkbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl WkbReader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| format!("WKB truncated at byte {}", self.pos))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u32(&mut self, little_endian: bool) -> Result<u32, String> {
        let b = self.take::<4>()?;
        Ok(if little_endian {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn f64(&mut self, little_endian: bool) -> Result<f64, String> {
        let b = self.take::<8>()?;
        Ok(if little_endian {
            f64::from_le_bytes(b)
        } else {
            f64::from_be_bytes(b)
        })
    }

    fn coord(&mut self, le: bool) -> Result<Coord<f64>, String> {
        let x = self.f64(le)?;
        let y = self.f64(le)?;
        Ok(Coord { x, y })
    }

    fn line_string(&mut self, le: bool) -> Result<LineString<f64>, String> {
        let n = self.u32(le)?;
        let coords = (0..n)
            .map(|_| self.coord(le))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LineString::new(coords))
    }

    fn polygon(&mut self, le: bool) -> Result<Polygon<f64>, String> {
        let rings = self.u32(le)?;
        let mut rings = (0..rings)
            .map(|_| self.line_string(le))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();
        let exterior = rings.next().unwrap_or_else(|| LineString::new(vec![]));
        Ok(Polygon::new(exterior, rings.collect()))
    }

    /// Members of a multi-geometry, each with its own WKB header.
    fn members(&mut self, le: bool, depth: usize) -> Result<Vec<Geometry<f64>>, String> {
        let n = self.u32(le)?;
        (0..n).map(|_| self.read_geometry(depth + 1)).collect()
    }

    fn read_geometry(&mut self, depth: usize) -> Result<Geometry<f64>, String> {
        if depth > MAX_DEPTH {
            return Err("geometry nesting too deep".to_string());
        }
        let [order] = self.take::<1>()?;
        let le = match order {
            0 => false,
            1 => true,
            other => return Err(format!("invalid WKB byte order {other}")),
        };
        let kind = self.u32(le)?;
        Ok(match kind {
            1 => Geometry::Point(Point(self.coord(le)?)),
            2 => Geometry::LineString(self.line_string(le)?),
            3 => Geometry::Polygon(self.polygon(le)?),
            4 => {
                let points = self
                    .members(le, depth)?
                    .into_iter()
                    .map(|g| match g {
                        Geometry::Point(p) => Ok(p),
                        _ => Err("MultiPoint member is not a Point".to_string()),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Geometry::MultiPoint(MultiPoint(points))
            }
            5 => {
                let lines = self
                    .members(le, depth)?
                    .into_iter()
                    .map(|g| match g {
                        Geometry::LineString(l) => Ok(l),
                        _ => Err("MultiLineString member is not a LineString".to_string()),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Geometry::MultiLineString(MultiLineString(lines))
            }
            6 => {
                let polygons = self
                    .members(le, depth)?
                    .into_iter()
                    .map(|g| match g {
                        Geometry::Polygon(p) => Ok(p),
                        _ => Err("MultiPolygon member is not a Polygon".to_string()),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Geometry::MultiPolygon(MultiPolygon(polygons))
            }
            7 => Geometry::GeometryCollection(GeometryCollection(self.members(le, depth)?)),
            other => return Err(format!("unsupported WKB geometry type {other}")),
        })
    }
}

fn coord_json(c: &Coord<f64>) -> JsonValue {
    json!([c.x, c.y])
}

fn line_json(line: &LineString<f64>) -> JsonValue {
    JsonValue::Array(line.0.iter().map(coord_json).collect())
}

fn polygon_json(polygon: &Polygon<f64>) -> JsonValue {
    let mut rings = vec![line_json(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(line_json));
    JsonValue::Array(rings)
}

fn geojson(geometry: &Geometry<f64>) -> JsonValue {
    match geometry {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": coord_json(&p.0)}),
        Geometry::LineString(l) => json!({"type": "LineString", "coordinates": line_json(l)}),
        Geometry::Polygon(p) => json!({"type": "Polygon", "coordinates": polygon_json(p)}),
        Geometry::MultiPoint(mp) => json!({
            "type": "MultiPoint",
            "coordinates": mp.0.iter().map(|p| coord_json(&p.0)).collect::<Vec<_>>()
        }),
        Geometry::MultiLineString(ml) => json!({
            "type": "MultiLineString",
            "coordinates": ml.0.iter().map(line_json).collect::<Vec<_>>()
        }),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon_json).collect::<Vec<_>>()
        }),
        Geometry::GeometryCollection(gc) => json!({
            "type": "GeometryCollection",
            "geometries": gc.0.iter().map(geojson).collect::<Vec<_>>()
        }),
        // Not produced by the WKB reader.
        Geometry::Line(_) | Geometry::Rect(_) | Geometry::Triangle(_) => JsonValue::Null,
    }
}
